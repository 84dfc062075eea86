//! Positioning engine seam
//!
//! The engine is an external collaborator: requests are synchronous calls that
//! may return an engine-minted session id, and every answer comes back later
//! as an [`EngineEvent`] posted onto the broker queue through an
//! [`EngineEventSink`]. Callbacks are never run on the engine's own thread.

use std::num::NonZeroU32;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use lh_protocol::{
    AntennaInfo, BatchingOptions, BreachType, CapabilityMask, ConfigCommand, DebugReport,
    EngineConfig, EngineLocation, FixFlavor, GeofenceOptions, GeofenceSpec, Location,
    LocationError, LocationInfo, PositionEngine, RobustLocationConfig, TrackingOptions,
    XtraDataStatus, XtraStatus,
};

use crate::broker::BrokerEvent;

/// Engine-minted session identifier; never zero.
pub type SessionId = NonZeroU32;

/// Outcome of an engine call that mints a session id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineTicket {
    Issued(SessionId),
    /// The engine refused the request outright (raw id 0)
    Rejected,
}

impl EngineTicket {
    pub fn from_raw(raw: u32) -> Self {
        match NonZeroU32::new(raw) {
            Some(id) => EngineTicket::Issued(id),
            None => EngineTicket::Rejected,
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        match self {
            EngineTicket::Issued(id) => Some(*id),
            EngineTicket::Rejected => None,
        }
    }
}

/// Per-session status inside a collective response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub session: u32,
    pub status: LocationError,
}

/// Parameters of the shared single-shot session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledSessionParams {
    pub interval_ms: u32,
    /// Technology mask for terrestrial fixes; ignored by the fused pool
    pub tech_mask: u32,
}

/// Callbacks from the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Answer to a tracking/batching start or update
    SessionResponse { session: u32, status: LocationError },
    /// Answer to a geofence add/remove/modify/pause/resume, one entry per fence
    GeofenceResponse { results: Vec<SessionStatus> },
    ConfigResponse { session: u32, status: LocationError },
    ConfigCollectiveResponse { results: Vec<SessionStatus> },
    /// Values for a config getter. Session 0 is an unsolicited broadcast.
    ConfigValue { session: u32, config: EngineConfig },
    TrackingLocation { info: LocationInfo },
    EngineLocations { locations: Vec<EngineLocation> },
    BatchedLocations { session: u32, locations: Vec<Location>, complete: bool },
    GeofenceBreach {
        sessions: Vec<u32>,
        location: Location,
        breach: BreachType,
        timestamp_ms: u64,
    },
    /// Fix produced by a pooled single-shot session
    PooledLocation { flavor: FixFlavor, location: Location },
    EnergyConsumed { total_energy_uws: u64 },
    AntennaInfo { antennas: Vec<AntennaInfo> },
}

impl EngineEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            EngineEvent::SessionResponse { .. } => "SessionResponse",
            EngineEvent::GeofenceResponse { .. } => "GeofenceResponse",
            EngineEvent::ConfigResponse { .. } => "ConfigResponse",
            EngineEvent::ConfigCollectiveResponse { .. } => "ConfigCollectiveResponse",
            EngineEvent::ConfigValue { .. } => "ConfigValue",
            EngineEvent::TrackingLocation { .. } => "TrackingLocation",
            EngineEvent::EngineLocations { .. } => "EngineLocations",
            EngineEvent::BatchedLocations { .. } => "BatchedLocations",
            EngineEvent::GeofenceBreach { .. } => "GeofenceBreach",
            EngineEvent::PooledLocation { .. } => "PooledLocation",
            EngineEvent::EnergyConsumed { .. } => "EnergyConsumed",
            EngineEvent::AntennaInfo { .. } => "AntennaInfo",
        }
    }
}

/// Posts engine callbacks into the broker's serialized event queue
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    queue: UnboundedSender<BrokerEvent>,
}

impl EngineEventSink {
    pub fn new(queue: UnboundedSender<BrokerEvent>) -> Self {
        Self { queue }
    }

    pub fn post(&self, event: EngineEvent) {
        trace!("Engine event: {}", event.type_name());
        if self.queue.send(BrokerEvent::Engine(event)).is_err() {
            debug!("Broker queue closed, dropping engine event");
        }
    }
}

/// Requests the broker issues to the positioning engine.
///
/// Calls returning `u32` return an engine session id where 0 means the
/// request failed immediately; the broker converts them with
/// [`EngineTicket::from_raw`].
pub trait PositioningEngine: Send {
    fn enable(&mut self);
    fn disable(&mut self);
    fn capabilities(&self) -> CapabilityMask;

    fn start_tracking(&mut self, options: &TrackingOptions) -> u32;
    fn stop_tracking(&mut self, session: SessionId);
    fn update_tracking_options(&mut self, session: SessionId, options: &TrackingOptions);

    fn start_batching(&mut self, options: &BatchingOptions) -> u32;
    fn stop_batching(&mut self, session: SessionId);
    fn update_batching_options(&mut self, session: SessionId, options: &BatchingOptions);

    /// One session id per entry, in order; 0 for an entry the engine refused.
    fn add_geofences(&mut self, geofences: &[GeofenceSpec]) -> Vec<u32>;
    fn remove_geofences(&mut self, sessions: &[SessionId]);
    fn modify_geofences(&mut self, changes: &[(SessionId, GeofenceOptions)]);
    fn pause_geofences(&mut self, sessions: &[SessionId]);
    fn resume_geofences(&mut self, sessions: &[SessionId]);

    fn configure(&mut self, command: &ConfigCommand) -> u32;
    fn delete_aiding_data(&mut self, engine_mask: u32) -> u32;

    fn start_pooled_session(&mut self, flavor: FixFlavor, params: PooledSessionParams) -> u32;
    fn stop_pooled_session(&mut self, flavor: FixFlavor, session: SessionId);

    fn request_energy_consumed(&mut self);
    fn request_antenna_info(&mut self);
    fn debug_report(&mut self) -> DebugReport;

    fn inject_location(&mut self, location: &Location);
    fn update_network_availability(&mut self, available: bool);
}

/// Engine used when no hardware engine is linked in.
///
/// Acknowledges everything through the sink and keeps the configuration it
/// was given so getters answer consistently. It computes no fixes: injected
/// locations are echoed to the active tracking sessions and pools.
pub struct LoopbackEngine {
    sink: EngineEventSink,
    next_session: u32,
    enabled: bool,
    tracking_sessions: usize,
    pools: Vec<(FixFlavor, SessionId)>,
    config: EngineConfig,
    fixes_reported: u64,
    last_location: Option<Location>,
}

impl LoopbackEngine {
    pub fn new(sink: EngineEventSink) -> Self {
        Self {
            sink,
            next_session: 0,
            enabled: false,
            tracking_sessions: 0,
            pools: Vec::new(),
            config: EngineConfig {
                robust_location: Some(RobustLocationConfig {
                    enabled: false,
                    enabled_for_e911: false,
                    major_version: 1,
                    minor_version: 0,
                }),
                min_gps_week: Some(0),
                min_sv_elevation: Some(5),
                secondary_band_disabled_mask: Some(0),
                xtra_status: Some(XtraStatus::default()),
            },
            fixes_reported: 0,
            last_location: None,
        }
    }

    fn mint(&mut self) -> u32 {
        self.next_session = self.next_session.wrapping_add(1).max(1);
        self.next_session
    }

    fn acknowledge(&mut self) -> u32 {
        let session = self.mint();
        self.sink.post(EngineEvent::SessionResponse { session, status: LocationError::Success });
        session
    }

    fn acknowledge_fences(&self, sessions: impl Iterator<Item = u32>) {
        let results = sessions
            .map(|session| SessionStatus { session, status: LocationError::Success })
            .collect();
        self.sink.post(EngineEvent::GeofenceResponse { results });
    }

    fn apply_config(&mut self, command: &ConfigCommand) -> Option<EngineConfig> {
        let values = &mut self.config;
        match command {
            ConfigCommand::RobustLocation { enable, enable_for_e911 } => {
                if let Some(robust) = values.robust_location.as_mut() {
                    robust.enabled = *enable;
                    robust.enabled_for_e911 = *enable_for_e911;
                }
            }
            ConfigCommand::MinGpsWeek { week } => values.min_gps_week = Some(*week),
            ConfigCommand::MinSvElevation { degrees } => values.min_sv_elevation = Some(*degrees),
            ConfigCommand::ConstellationSecondaryBand { disabled_mask } => {
                values.secondary_band_disabled_mask = Some(*disabled_mask)
            }
            ConfigCommand::XtraParams { enable, .. } => {
                let status = values.xtra_status.get_or_insert_with(XtraStatus::default);
                status.feature_enabled = *enable;
                status.data_status =
                    if *enable { XtraDataStatus::NotAvailable } else { XtraDataStatus::Unknown };
            }
            ConfigCommand::GetRobustLocationConfig => {
                return Some(EngineConfig {
                    robust_location: values.robust_location,
                    ..EngineConfig::default()
                })
            }
            ConfigCommand::GetMinGpsWeek => {
                return Some(EngineConfig {
                    min_gps_week: values.min_gps_week,
                    ..EngineConfig::default()
                })
            }
            ConfigCommand::GetMinSvElevation => {
                return Some(EngineConfig {
                    min_sv_elevation: values.min_sv_elevation,
                    ..EngineConfig::default()
                })
            }
            ConfigCommand::GetConstellationSecondaryBandConfig => {
                return Some(EngineConfig {
                    secondary_band_disabled_mask: values.secondary_band_disabled_mask,
                    ..EngineConfig::default()
                })
            }
            ConfigCommand::GetXtraStatus | ConfigCommand::RegisterXtraStatusUpdates => {
                return Some(EngineConfig {
                    xtra_status: values.xtra_status,
                    ..EngineConfig::default()
                })
            }
            _ => {}
        }
        None
    }
}

impl PositioningEngine for LoopbackEngine {
    fn enable(&mut self) {
        self.enabled = true;
        debug!("Loopback engine enabled");
    }

    fn disable(&mut self) {
        self.enabled = false;
        self.tracking_sessions = 0;
        self.pools.clear();
        debug!("Loopback engine disabled");
    }

    fn capabilities(&self) -> CapabilityMask {
        CapabilityMask::TIME_BASED_TRACKING
            | CapabilityMask::DISTANCE_BASED_TRACKING
            | CapabilityMask::TIME_BASED_BATCHING
            | CapabilityMask::DISTANCE_BASED_BATCHING
            | CapabilityMask::OUTDOOR_TRIP_BATCHING
            | CapabilityMask::GEOFENCE
            | CapabilityMask::CONSTELLATION_ENABLEMENT
            | CapabilityMask::TERRESTRIAL_POSITIONING
            | CapabilityMask::ENGINE_LOCATIONS
    }

    fn start_tracking(&mut self, _options: &TrackingOptions) -> u32 {
        self.tracking_sessions += 1;
        self.acknowledge()
    }

    fn stop_tracking(&mut self, _session: SessionId) {
        self.tracking_sessions = self.tracking_sessions.saturating_sub(1);
    }

    fn update_tracking_options(&mut self, session: SessionId, _options: &TrackingOptions) {
        self.sink.post(EngineEvent::SessionResponse {
            session: session.get(),
            status: LocationError::Success,
        });
    }

    fn start_batching(&mut self, _options: &BatchingOptions) -> u32 {
        self.acknowledge()
    }

    fn stop_batching(&mut self, _session: SessionId) {}

    fn update_batching_options(&mut self, session: SessionId, _options: &BatchingOptions) {
        self.sink.post(EngineEvent::SessionResponse {
            session: session.get(),
            status: LocationError::Success,
        });
    }

    fn add_geofences(&mut self, geofences: &[GeofenceSpec]) -> Vec<u32> {
        let sessions: Vec<u32> = geofences.iter().map(|_| self.mint()).collect();
        self.acknowledge_fences(sessions.iter().copied());
        sessions
    }

    fn remove_geofences(&mut self, sessions: &[SessionId]) {
        self.acknowledge_fences(sessions.iter().map(|s| s.get()));
    }

    fn modify_geofences(&mut self, changes: &[(SessionId, GeofenceOptions)]) {
        self.acknowledge_fences(changes.iter().map(|(s, _)| s.get()));
    }

    fn pause_geofences(&mut self, sessions: &[SessionId]) {
        self.acknowledge_fences(sessions.iter().map(|s| s.get()));
    }

    fn resume_geofences(&mut self, sessions: &[SessionId]) {
        self.acknowledge_fences(sessions.iter().map(|s| s.get()));
    }

    fn configure(&mut self, command: &ConfigCommand) -> u32 {
        let session = self.mint();
        match self.apply_config(command) {
            Some(config) => self.sink.post(EngineEvent::ConfigValue { session, config }),
            None => self.sink.post(EngineEvent::ConfigResponse {
                session,
                status: LocationError::Success,
            }),
        }
        session
    }

    fn delete_aiding_data(&mut self, engine_mask: u32) -> u32 {
        debug!("Loopback engine deleting aiding data (engine mask {:#x})", engine_mask);
        self.last_location = None;
        let session = self.mint();
        self.sink.post(EngineEvent::ConfigResponse { session, status: LocationError::Success });
        session
    }

    fn start_pooled_session(&mut self, flavor: FixFlavor, _params: PooledSessionParams) -> u32 {
        let session = self.mint();
        if let Some(id) = NonZeroU32::new(session) {
            self.pools.push((flavor, id));
        }
        session
    }

    fn stop_pooled_session(&mut self, flavor: FixFlavor, session: SessionId) {
        self.pools.retain(|entry| *entry != (flavor, session));
    }

    fn request_energy_consumed(&mut self) {
        self.sink.post(EngineEvent::EnergyConsumed { total_energy_uws: 0 });
    }

    fn request_antenna_info(&mut self) {
        self.sink.post(EngineEvent::AntennaInfo {
            antennas: vec![AntennaInfo {
                carrier_frequency_mhz: 1575.42,
                phase_center_offset_x_mm: 0.0,
                phase_center_offset_y_mm: 0.0,
                phase_center_offset_z_mm: 0.0,
            }],
        });
    }

    fn debug_report(&mut self) -> DebugReport {
        DebugReport {
            engine_enabled: self.enabled,
            fixes_reported: self.fixes_reported,
            last_location: self.last_location,
        }
    }

    fn inject_location(&mut self, location: &Location) {
        self.last_location = Some(*location);
        if self.tracking_sessions > 0 {
            self.fixes_reported += 1;
            self.sink.post(EngineEvent::TrackingLocation {
                info: LocationInfo { location: *location, ..LocationInfo::default() },
            });
            self.sink.post(EngineEvent::EngineLocations {
                locations: vec![EngineLocation {
                    engine: PositionEngine::Fused,
                    location: *location,
                }],
            });
        }
        for (flavor, _) in &self.pools {
            self.sink.post(EngineEvent::PooledLocation { flavor: *flavor, location: *location });
        }
    }

    fn update_network_availability(&mut self, available: bool) {
        debug!("Loopback engine network available: {}", available);
    }
}
