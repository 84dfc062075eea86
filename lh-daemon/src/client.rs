//! Per-client state and session operations
//!
//! A [`ClientHandle`] is owned by the registry and only ever reached by name
//! lookup. Tracking and batching sessions are engine sessions; geofences are
//! kept as a client-id to engine-session mapping that is only updated once
//! the engine confirms an operation.

use std::collections::{BTreeMap, VecDeque};

use bitflags::bitflags;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use lh_error::{LocHalError, Result};
use lh_protocol::{
    BatchingOptions, CallbackMask, CapabilityMask, ClientKind, GeofenceModification,
    GeofenceOptions, GeofenceResult, GeofenceSpec, Indication, LocationError, PositionMode,
    RequestKind, TrackingOptions, MAX_GEOFENCE_COUNT,
};

use crate::engine::{EngineTicket, PositioningEngine, SessionId, SessionStatus};

/// Outbound channel to one client.
///
/// A link created with [`ClientLink::detached`] belongs to a client the
/// daemon hosts itself; it swallows every message and never fails.
#[derive(Debug, Clone)]
pub struct ClientLink {
    connection: u64,
    tx: Option<UnboundedSender<Indication>>,
}

impl ClientLink {
    pub fn connected(connection: u64, tx: UnboundedSender<Indication>) -> Self {
        Self { connection, tx: Some(tx) }
    }

    pub fn detached() -> Self {
        Self { connection: 0, tx: None }
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn is_detached(&self) -> bool {
        self.tx.is_none()
    }

    /// Whether both links are the same live connection
    pub fn same_connection(&self, other: &ClientLink) -> bool {
        !self.is_detached() && self.connection == other.connection
    }

    /// Queue a message; fails once the connection's writer has gone away.
    pub fn send(&self, name: &str, indication: Indication) -> Result<()> {
        match &self.tx {
            None => Ok(()),
            Some(tx) => tx
                .send(indication)
                .map_err(|_| LocHalError::ClientGone(name.to_string())),
        }
    }
}

bitflags! {
    /// Engine queries answered by a broadcast callback
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EngineInfoRequest: u8 {
        const ENERGY_CONSUMED = 1 << 0;
        const ANTENNA_INFO = 1 << 1;
    }
}

/// An accepted geofence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofenceEntry {
    pub session: SessionId,
    pub spec: GeofenceSpec,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FenceChange {
    Add(GeofenceSpec),
    Remove,
    Modify(GeofenceOptions),
    Pause,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingFence {
    id: u32,
    session: SessionId,
    change: FenceChange,
}

/// A geofence operation waiting for the engine's collective response
#[derive(Debug, Clone, PartialEq)]
struct PendingGeofenceOp {
    request: RequestKind,
    waiting: Vec<PendingFence>,
    results: Vec<GeofenceResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingAck {
    session: SessionId,
    request: RequestKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingSession {
    pub session: SessionId,
    pub options: BatchingOptions,
}

pub struct ClientHandle {
    name: String,
    kind: ClientKind,
    link: ClientLink,
    /// Set once a send failed; the broker reaps such clients
    gone: bool,
    callbacks: CallbackMask,
    tracking: Option<SessionId>,
    tracking_options: Option<TrackingOptions>,
    batching: Option<BatchingSession>,
    geofences: BTreeMap<u32, GeofenceEntry>,
    pending_acks: VecDeque<PendingAck>,
    pending_geofence_ops: Vec<PendingGeofenceOp>,
    pending_engine_info: EngineInfoRequest,
}

impl ClientHandle {
    pub fn new(name: impl Into<String>, kind: ClientKind, link: ClientLink) -> Self {
        Self {
            name: name.into(),
            kind,
            link,
            gone: false,
            callbacks: CallbackMask::empty(),
            tracking: None,
            tracking_options: None,
            batching: None,
            geofences: BTreeMap::new(),
            pending_acks: VecDeque::new(),
            pending_geofence_ops: Vec::new(),
            pending_engine_info: EngineInfoRequest::empty(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn link(&self) -> &ClientLink {
        &self.link
    }

    pub fn rebind(&mut self, link: ClientLink) {
        self.link = link;
        self.gone = false;
    }

    pub fn is_gone(&self) -> bool {
        self.gone
    }

    pub fn callbacks(&self) -> CallbackMask {
        self.callbacks
    }

    pub fn tracking_session(&self) -> Option<SessionId> {
        self.tracking
    }

    pub fn tracking_options(&self) -> Option<TrackingOptions> {
        self.tracking_options
    }

    pub fn batching_session(&self) -> Option<BatchingSession> {
        self.batching
    }

    pub fn geofences(&self) -> &BTreeMap<u32, GeofenceEntry> {
        &self.geofences
    }

    pub fn pending_engine_info(&self) -> EngineInfoRequest {
        self.pending_engine_info
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty() || !self.pending_geofence_ops.is_empty()
    }

    /// Send one message. A failure marks the client gone instead of
    /// propagating; cleanup happens once the current handler finishes.
    pub fn send(&mut self, indication: Indication) -> bool {
        if self.gone {
            return false;
        }
        match self.link.send(&self.name, indication) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                self.gone = true;
                false
            }
        }
    }

    fn respond(&mut self, request: RequestKind, status: LocationError) {
        self.send(Indication::response(request, status));
    }

    pub fn send_capabilities(&mut self, capabilities: CapabilityMask) {
        self.send(Indication::Capabilities { capabilities });
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    pub fn start_tracking(
        &mut self,
        engine: &mut dyn PositioningEngine,
        options: TrackingOptions,
        master_mode: Option<PositionMode>,
    ) {
        let options = apply_master_mode(options, master_mode);
        self.tracking_options = Some(options);

        if let Some(session) = self.tracking {
            debug!("{}: tracking already active, updating session {}", self.name, session);
            engine.update_tracking_options(session, &options);
            self.pending_acks.push_back(PendingAck { session, request: RequestKind::StartTracking });
            return;
        }

        match EngineTicket::from_raw(engine.start_tracking(&options)) {
            EngineTicket::Issued(session) => {
                debug!("{}: tracking session {} started", self.name, session);
                self.tracking = Some(session);
                self.pending_acks.push_back(PendingAck { session, request: RequestKind::StartTracking });
            }
            EngineTicket::Rejected => {
                warn!("{}: engine refused to start tracking", self.name);
                self.respond(RequestKind::StartTracking, LocationError::GeneralFailure);
            }
        }
    }

    pub fn stop_tracking(&mut self, engine: &mut dyn PositioningEngine, preserve_subscriptions: bool) {
        self.end_tracking(engine, preserve_subscriptions);
        self.respond(RequestKind::StopTracking, LocationError::Success);
    }

    fn end_tracking(&mut self, engine: &mut dyn PositioningEngine, preserve_subscriptions: bool) {
        if let Some(session) = self.tracking.take() {
            engine.stop_tracking(session);
            debug!("{}: tracking session {} stopped", self.name, session);
        }
        if !preserve_subscriptions {
            self.callbacks = CallbackMask::empty();
        }
    }

    pub fn update_subscription(&mut self, callbacks: CallbackMask) {
        self.callbacks = callbacks;
        self.respond(RequestKind::UpdateSubscription, LocationError::Success);
    }

    /// Set the subscription without acknowledging, for daemon-hosted clients.
    pub fn set_callbacks(&mut self, callbacks: CallbackMask) {
        self.callbacks = callbacks;
    }

    pub fn update_tracking_options(
        &mut self,
        engine: &mut dyn PositioningEngine,
        options: TrackingOptions,
        master_mode: Option<PositionMode>,
    ) {
        let options = apply_master_mode(options, master_mode);
        self.tracking_options = Some(options);
        match self.tracking {
            Some(session) => {
                engine.update_tracking_options(session, &options);
                self.pending_acks.push_back(PendingAck {
                    session,
                    request: RequestKind::UpdateTrackingOptions,
                });
            }
            // Stored for the next start
            None => self.respond(RequestKind::UpdateTrackingOptions, LocationError::Success),
        }
    }

    // ========================================================================
    // Batching
    // ========================================================================

    pub fn start_batching(&mut self, engine: &mut dyn PositioningEngine, options: BatchingOptions) {
        if let Some(active) = self.batching.as_mut() {
            active.options = options;
            let session = active.session;
            engine.update_batching_options(session, &options);
            self.pending_acks.push_back(PendingAck { session, request: RequestKind::StartBatching });
            return;
        }

        match EngineTicket::from_raw(engine.start_batching(&options)) {
            EngineTicket::Issued(session) => {
                debug!("{}: batching session {} started ({:?})", self.name, session, options.mode);
                self.batching = Some(BatchingSession { session, options });
                self.pending_acks.push_back(PendingAck { session, request: RequestKind::StartBatching });
            }
            EngineTicket::Rejected => {
                warn!("{}: engine refused to start batching", self.name);
                self.respond(RequestKind::StartBatching, LocationError::GeneralFailure);
            }
        }
    }

    pub fn stop_batching(&mut self, engine: &mut dyn PositioningEngine) {
        self.end_batching(engine);
        self.respond(RequestKind::StopBatching, LocationError::Success);
    }

    fn end_batching(&mut self, engine: &mut dyn PositioningEngine) {
        if let Some(active) = self.batching.take() {
            engine.stop_batching(active.session);
            debug!("{}: batching session {} stopped", self.name, active.session);
        }
        self.callbacks.remove(CallbackMask::BATCHING_CALLBACKS);
    }

    pub fn update_batching_options(&mut self, engine: &mut dyn PositioningEngine, options: BatchingOptions) {
        match self.batching.as_mut() {
            Some(active) => {
                active.options = options;
                let session = active.session;
                engine.update_batching_options(session, &options);
                self.pending_acks.push_back(PendingAck {
                    session,
                    request: RequestKind::UpdateBatchingOptions,
                });
            }
            None => self.respond(RequestKind::UpdateBatchingOptions, LocationError::NotInitialized),
        }
    }

    /// Deliver the engine's answer to a tracking/batching start or update.
    /// Returns false when no request of this client waits on `session`.
    pub fn on_session_response(&mut self, session: SessionId, status: LocationError) -> bool {
        let Some(pos) = self.pending_acks.iter().position(|ack| ack.session == session) else {
            return false;
        };
        let ack = self.pending_acks.remove(pos).map(|ack| ack.request);
        let Some(request) = ack else {
            return false;
        };

        if !status.is_success() {
            match request {
                RequestKind::StartTracking if self.tracking == Some(session) => {
                    self.tracking = None;
                }
                RequestKind::StartBatching
                    if self.batching.map(|b| b.session) == Some(session) =>
                {
                    self.batching = None;
                }
                _ => {}
            }
        }
        self.respond(request, status);
        true
    }

    // ========================================================================
    // Geofences
    // ========================================================================

    pub fn add_geofences(&mut self, engine: &mut dyn PositioningEngine, geofences: &[GeofenceSpec]) {
        if geofences.len() > MAX_GEOFENCE_COUNT {
            warn!(
                "{}: rejecting {} geofences (max {} per call)",
                self.name,
                geofences.len(),
                MAX_GEOFENCE_COUNT
            );
            self.respond(RequestKind::AddGeofences, LocationError::InvalidParameter);
            return;
        }

        let mut results = Vec::new();
        let mut accepted = Vec::new();
        for spec in geofences {
            if self.geofences.contains_key(&spec.id) || self.is_fence_pending_add(spec.id) {
                results.push(GeofenceResult { id: spec.id, status: LocationError::IdExist });
            } else {
                accepted.push(*spec);
            }
        }

        let mut waiting = Vec::new();
        if !accepted.is_empty() {
            let sessions = engine.add_geofences(&accepted);
            for (index, spec) in accepted.iter().enumerate() {
                let ticket = EngineTicket::from_raw(sessions.get(index).copied().unwrap_or(0));
                match ticket {
                    EngineTicket::Issued(session) => waiting.push(PendingFence {
                        id: spec.id,
                        session,
                        change: FenceChange::Add(*spec),
                    }),
                    EngineTicket::Rejected => results.push(GeofenceResult {
                        id: spec.id,
                        status: LocationError::GeneralFailure,
                    }),
                }
            }
        }

        self.queue_geofence_op(RequestKind::AddGeofences, waiting, results);
    }

    pub fn remove_geofences(&mut self, engine: &mut dyn PositioningEngine, ids: &[u32]) {
        let waiting = self.translate(ids, |_| FenceChange::Remove);
        if !waiting.is_empty() {
            engine.remove_geofences(&sessions_of(&waiting));
        }
        self.queue_geofence_op(RequestKind::RemoveGeofences, waiting, Vec::new());
    }

    pub fn modify_geofences(&mut self, engine: &mut dyn PositioningEngine, changes: &[GeofenceModification]) {
        if changes.len() > MAX_GEOFENCE_COUNT {
            self.respond(RequestKind::ModifyGeofences, LocationError::InvalidParameter);
            return;
        }
        let mut waiting = Vec::new();
        for change in changes {
            if let Some(entry) = self.geofences.get(&change.id) {
                waiting.push(PendingFence {
                    id: change.id,
                    session: entry.session,
                    change: FenceChange::Modify(change.options),
                });
            }
        }
        if !waiting.is_empty() {
            let engine_changes: Vec<(SessionId, GeofenceOptions)> = waiting
                .iter()
                .filter_map(|p| match p.change {
                    FenceChange::Modify(options) => Some((p.session, options)),
                    _ => None,
                })
                .collect();
            engine.modify_geofences(&engine_changes);
        }
        self.queue_geofence_op(RequestKind::ModifyGeofences, waiting, Vec::new());
    }

    pub fn pause_geofences(&mut self, engine: &mut dyn PositioningEngine, ids: &[u32]) {
        let waiting = self.translate(ids, |_| FenceChange::Pause);
        if !waiting.is_empty() {
            engine.pause_geofences(&sessions_of(&waiting));
        }
        self.queue_geofence_op(RequestKind::PauseGeofences, waiting, Vec::new());
    }

    pub fn resume_geofences(&mut self, engine: &mut dyn PositioningEngine, ids: &[u32]) {
        let waiting = self.translate(ids, |_| FenceChange::Resume);
        if !waiting.is_empty() {
            engine.resume_geofences(&sessions_of(&waiting));
        }
        self.queue_geofence_op(RequestKind::ResumeGeofences, waiting, Vec::new());
    }

    /// Ids without a mapping are skipped.
    fn translate(&self, ids: &[u32], change: impl Fn(&GeofenceEntry) -> FenceChange) -> Vec<PendingFence> {
        ids.iter()
            .filter_map(|id| {
                self.geofences.get(id).map(|entry| PendingFence {
                    id: *id,
                    session: entry.session,
                    change: change(entry),
                })
            })
            .collect()
    }

    fn is_fence_pending_add(&self, id: u32) -> bool {
        self.pending_geofence_ops.iter().any(|op| {
            op.waiting
                .iter()
                .any(|p| p.id == id && matches!(p.change, FenceChange::Add(_)))
        })
    }

    fn queue_geofence_op(&mut self, request: RequestKind, waiting: Vec<PendingFence>, results: Vec<GeofenceResult>) {
        if waiting.is_empty() {
            self.send(Indication::GeofenceResponse { request, results });
        } else {
            self.pending_geofence_ops.push(PendingGeofenceOp { request, waiting, results });
        }
    }

    pub fn owns_pending_fence(&self, session: u32) -> bool {
        self.pending_geofence_ops
            .iter()
            .any(|op| op.waiting.iter().any(|p| p.session.get() == session))
    }

    /// Apply the engine's per-fence results; completed operations are
    /// answered with one collective response each.
    pub fn on_geofence_response(&mut self, results: &[SessionStatus]) {
        for result in results {
            let mut resolved = None;
            for op in self.pending_geofence_ops.iter_mut() {
                if let Some(pos) = op.waiting.iter().position(|p| p.session.get() == result.session) {
                    let fence = op.waiting.remove(pos);
                    op.results.push(GeofenceResult { id: fence.id, status: result.status });
                    resolved = Some(fence);
                    break;
                }
            }
            if let Some(fence) = resolved {
                if result.status.is_success() {
                    self.apply_fence_change(fence);
                }
            }
        }

        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_geofence_ops)
            .into_iter()
            .partition(|op| op.waiting.is_empty());
        self.pending_geofence_ops = pending;
        for op in done {
            self.send(Indication::GeofenceResponse { request: op.request, results: op.results });
        }
    }

    fn apply_fence_change(&mut self, fence: PendingFence) {
        match fence.change {
            FenceChange::Add(spec) => {
                self.geofences.insert(
                    fence.id,
                    GeofenceEntry { session: fence.session, spec, paused: false },
                );
            }
            FenceChange::Remove => {
                self.geofences.remove(&fence.id);
            }
            FenceChange::Modify(options) => {
                if let Some(entry) = self.geofences.get_mut(&fence.id) {
                    entry.spec.options = options;
                }
            }
            FenceChange::Pause | FenceChange::Resume => {
                if let Some(entry) = self.geofences.get_mut(&fence.id) {
                    entry.paused = matches!(fence.change, FenceChange::Pause);
                }
            }
        }
    }

    /// Client ids of the geofences behind the given engine sessions
    pub fn fence_ids_for(&self, sessions: &[u32]) -> Vec<u32> {
        self.geofences
            .iter()
            .filter(|(_, entry)| sessions.contains(&entry.session.get()))
            .map(|(id, _)| *id)
            .collect()
    }

    // ========================================================================
    // Engine info queries
    // ========================================================================

    pub fn mark_engine_info_pending(&mut self, request: EngineInfoRequest) {
        self.pending_engine_info.insert(request);
    }

    /// Clears the pending bit and reports whether it was set.
    pub fn take_engine_info_pending(&mut self, request: EngineInfoRequest) -> bool {
        let was_pending = self.pending_engine_info.contains(request);
        self.pending_engine_info.remove(request);
        was_pending
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stop every engine session this client owns. Used on deregistration;
    /// sends nothing to the client.
    pub fn release(&mut self, engine: &mut dyn PositioningEngine) {
        self.end_tracking(engine, false);
        self.end_batching(engine);

        let mut sessions: Vec<SessionId> = self.geofences.values().map(|entry| entry.session).collect();
        // Fences the engine accepted but has not confirmed yet
        for op in &self.pending_geofence_ops {
            for fence in &op.waiting {
                if matches!(fence.change, FenceChange::Add(_)) {
                    sessions.push(fence.session);
                }
            }
        }
        if !sessions.is_empty() {
            debug!("{}: releasing {} geofences", self.name, sessions.len());
            engine.remove_geofences(&sessions);
        }
        self.geofences.clear();
        self.pending_geofence_ops.clear();
        self.pending_acks.clear();
        self.pending_engine_info = EngineInfoRequest::empty();
    }
}

fn apply_master_mode(mut options: TrackingOptions, master_mode: Option<PositionMode>) -> TrackingOptions {
    if let Some(mode) = master_mode {
        options.mode = mode;
    }
    options
}

fn sessions_of(fences: &[PendingFence]) -> Vec<SessionId> {
    fences.iter().map(|p| p.session).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{Call, RecordingEngine};
    use lh_protocol::{BatchingMode, BreachMask};
    use tokio::sync::mpsc;

    fn handle() -> (ClientHandle, mpsc::UnboundedReceiver<Indication>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new("app1", ClientKind::LocationClientApi, ClientLink::connected(1, tx)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Indication>) -> Vec<Indication> {
        let mut out = Vec::new();
        while let Ok(ind) = rx.try_recv() {
            out.push(ind);
        }
        out
    }

    fn fence(id: u32) -> GeofenceSpec {
        GeofenceSpec {
            id,
            latitude: 37.0,
            longitude: -122.0,
            radius_m: 150.0,
            options: GeofenceOptions {
                breach_mask: BreachMask::ENTER,
                responsiveness_ms: 1000,
                dwell_time_s: 0,
            },
        }
    }

    fn tracking(interval: u32) -> TrackingOptions {
        TrackingOptions { min_interval_ms: interval, min_distance_m: 0, mode: PositionMode::Standalone }
    }

    fn ok(session: u32) -> SessionStatus {
        SessionStatus { session, status: LocationError::Success }
    }

    #[test]
    fn test_tracking_ack_waits_for_engine() {
        let (mut client, mut rx) = handle();
        let mut engine = RecordingEngine::new();

        client.start_tracking(&mut engine, tracking(1000), None);
        let session = client.tracking_session().unwrap();
        assert!(drain(&mut rx).is_empty());

        assert!(client.on_session_response(session, LocationError::Success));
        assert_eq!(drain(&mut rx), vec![Indication::success(RequestKind::StartTracking)]);
        assert!(!client.on_session_response(session, LocationError::Success));
    }

    #[test]
    fn test_rejected_tracking_answers_failure() {
        let (mut client, mut rx) = handle();
        let mut engine = RecordingEngine::new();
        engine.set(|s| s.reject_sessions = true);

        client.start_tracking(&mut engine, tracking(1000), None);
        assert!(client.tracking_session().is_none());
        assert_eq!(
            drain(&mut rx),
            vec![Indication::response(RequestKind::StartTracking, LocationError::GeneralFailure)]
        );
    }

    #[test]
    fn test_master_mode_overrides_client_mode() {
        let (mut client, _rx) = handle();
        let mut engine = RecordingEngine::new();

        client.start_tracking(&mut engine, tracking(500), Some(PositionMode::MsBased));
        assert_eq!(
            engine.calls(),
            vec![Call::StartTracking(TrackingOptions {
                min_interval_ms: 500,
                min_distance_m: 0,
                mode: PositionMode::MsBased,
            })]
        );
    }

    #[test]
    fn test_stop_tracking_subscription_handling() {
        let (mut client, _rx) = handle();
        let mut engine = RecordingEngine::new();
        client.update_subscription(CallbackMask::TRACKING);

        client.start_tracking(&mut engine, tracking(1000), None);
        client.stop_tracking(&mut engine, true);
        assert_eq!(client.callbacks(), CallbackMask::TRACKING);
        assert!(client.tracking_session().is_none());

        client.start_tracking(&mut engine, tracking(1000), None);
        client.stop_tracking(&mut engine, false);
        assert!(client.callbacks().is_empty());
    }

    #[test]
    fn test_stop_batching_clears_batching_callbacks_only() {
        let (mut client, _rx) = handle();
        let mut engine = RecordingEngine::new();
        client.update_subscription(CallbackMask::TRACKING | CallbackMask::BATCHING_CALLBACKS);

        client.start_batching(
            &mut engine,
            BatchingOptions { min_interval_ms: 1000, min_distance_m: 0, mode: BatchingMode::Routine },
        );
        assert!(client.batching_session().is_some());

        client.stop_batching(&mut engine);
        assert!(client.batching_session().is_none());
        assert_eq!(client.callbacks(), CallbackMask::TRACKING);
    }

    #[test]
    fn test_geofence_mapping_recorded_after_confirmation() {
        let (mut client, mut rx) = handle();
        let mut engine = RecordingEngine::new();

        client.add_geofences(&mut engine, &[fence(10), fence(11)]);
        assert!(client.geofences().is_empty());
        assert!(drain(&mut rx).is_empty());

        client.on_geofence_response(&[ok(1)]);
        assert_eq!(client.geofences().len(), 1);
        assert!(drain(&mut rx).is_empty());

        client.on_geofence_response(&[ok(2)]);
        assert_eq!(client.geofences().keys().copied().collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(
            drain(&mut rx),
            vec![Indication::GeofenceResponse {
                request: RequestKind::AddGeofences,
                results: vec![
                    GeofenceResult { id: 10, status: LocationError::Success },
                    GeofenceResult { id: 11, status: LocationError::Success },
                ],
            }]
        );
    }

    #[test]
    fn test_oversized_geofence_batch_leaves_state_untouched() {
        let (mut client, mut rx) = handle();
        let mut engine = RecordingEngine::new();
        client.add_geofences(&mut engine, &[fence(1)]);
        client.on_geofence_response(&[ok(1)]);
        drain(&mut rx);
        let before = client.geofences().clone();

        let batch: Vec<GeofenceSpec> = (100..125).map(fence).collect();
        client.add_geofences(&mut engine, &batch);

        assert_eq!(client.geofences(), &before);
        assert_eq!(engine.count(|c| matches!(c, Call::AddGeofences(_))), 1);
        assert_eq!(
            drain(&mut rx),
            vec![Indication::response(RequestKind::AddGeofences, LocationError::InvalidParameter)]
        );
    }

    #[test]
    fn test_duplicate_and_refused_fences_reported_per_entry() {
        let (mut client, mut rx) = handle();
        let mut engine = RecordingEngine::new();
        engine.set(|s| s.reject_fence_ids = vec![3]);
        client.add_geofences(&mut engine, &[fence(1)]);
        client.on_geofence_response(&[ok(1)]);
        drain(&mut rx);

        client.add_geofences(&mut engine, &[fence(1), fence(3)]);
        assert_eq!(
            drain(&mut rx),
            vec![Indication::GeofenceResponse {
                request: RequestKind::AddGeofences,
                results: vec![
                    GeofenceResult { id: 1, status: LocationError::IdExist },
                    GeofenceResult { id: 3, status: LocationError::GeneralFailure },
                ],
            }]
        );
    }

    #[test]
    fn test_unknown_ids_are_skipped() {
        let (mut client, mut rx) = handle();
        let mut engine = RecordingEngine::new();
        client.add_geofences(&mut engine, &[fence(5)]);
        client.on_geofence_response(&[ok(1)]);
        drain(&mut rx);

        client.pause_geofences(&mut engine, &[5, 99]);
        assert_eq!(engine.calls().last(), Some(&Call::PauseGeofences(vec![1])));
        client.on_geofence_response(&[ok(1)]);
        assert!(client.geofences()[&5].paused);

        client.remove_geofences(&mut engine, &[42]);
        assert_eq!(engine.count(|c| matches!(c, Call::RemoveGeofences(_))), 0);
        let messages = drain(&mut rx);
        assert_eq!(
            messages.last(),
            Some(&Indication::GeofenceResponse { request: RequestKind::RemoveGeofences, results: vec![] })
        );
    }

    #[test]
    fn test_release_stops_everything() {
        let (mut client, mut rx) = handle();
        let mut engine = RecordingEngine::new();
        client.update_subscription(CallbackMask::TRACKING);
        client.start_tracking(&mut engine, tracking(1000), None);
        client.add_geofences(&mut engine, &[fence(1), fence(2)]);
        client.on_geofence_response(&[ok(2)]);
        drain(&mut rx);

        client.release(&mut engine);

        assert!(client.tracking_session().is_none());
        assert!(client.geofences().is_empty());
        assert!(!client.has_pending_acks());
        assert_eq!(engine.calls().last(), Some(&Call::RemoveGeofences(vec![2, 3])));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_send_failure_marks_gone() {
        let (mut client, rx) = handle();
        drop(rx);
        assert!(!client.send(Indication::Ping));
        assert!(client.is_gone());
    }

    #[test]
    fn test_detached_link_never_fails() {
        let mut client = ClientHandle::new("default", ClientKind::LocationClientApi, ClientLink::detached());
        assert!(client.send(Indication::Ping));
        assert!(!client.is_gone());
    }
}
