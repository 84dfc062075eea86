//! Single-shot fix arbitration
//!
//! One arbiter per [`FixFlavor`]. Clients ask for a one-off fix; the arbiter
//! serves all of them from one pooled engine session that exists exactly
//! while at least one request is outstanding.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use lh_protocol::{FixFlavor, Indication, Location, LocationError};

use crate::broker::BrokerEvent;
use crate::engine::{EngineTicket, PooledSessionParams, PositioningEngine, SessionId};
use crate::timer::Timer;

/// A message owed to a named client
pub type Delivery = (String, Indication);

/// Quality requirement of a request. Which field matters depends on the flavor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FixQos {
    /// Fused: the fix must be strictly more accurate than this
    pub accuracy_m: f32,
    /// Terrestrial: technologies the network fix may use
    pub tech_mask: u32,
}

#[derive(Debug)]
struct FixRequest {
    qos: FixQos,
    generation: u64,
    timer: Timer,
}

pub struct SingleShotFixArbiter {
    flavor: FixFlavor,
    pooled_interval_ms: u32,
    queue: UnboundedSender<BrokerEvent>,
    requests: HashMap<String, FixRequest>,
    pool: Option<SessionId>,
    /// Technology mask the running pool was started with
    pool_tech_mask: u32,
    last_location: Option<Location>,
    next_generation: u64,
}

impl SingleShotFixArbiter {
    pub fn new(flavor: FixFlavor, pooled_interval_ms: u32, queue: UnboundedSender<BrokerEvent>) -> Self {
        Self {
            flavor,
            pooled_interval_ms,
            queue,
            requests: HashMap::new(),
            pool: None,
            pool_tech_mask: 0,
            last_location: None,
            next_generation: 0,
        }
    }

    pub fn flavor(&self) -> FixFlavor {
        self.flavor
    }

    pub fn is_pool_active(&self) -> bool {
        self.pool.is_some()
    }

    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    pub fn has_request(&self, client: &str) -> bool {
        self.requests.contains_key(client)
    }

    /// Whether a request only cancels. A fused request needs both a timeout
    /// and an accuracy threshold; a terrestrial one cancels only when the
    /// timeout and the technology mask are both zero.
    pub fn is_cancellation(flavor: FixFlavor, timeout_ms: u32, qos: &FixQos) -> bool {
        match flavor {
            FixFlavor::Fused => timeout_ms == 0 || qos.accuracy_m == 0.0,
            FixFlavor::Terrestrial => timeout_ms == 0 && qos.tech_mask == 0,
        }
    }

    fn satisfies(&self, qos: &FixQos, location: &Location) -> bool {
        match self.flavor {
            FixFlavor::Fused => location.is_qualified_fix() && location.accuracy < qos.accuracy_m,
            FixFlavor::Terrestrial => location.has_position(),
        }
    }

    /// Replace the client's request, or only drop it when the new request is
    /// a cancellation.
    pub fn request(
        &mut self,
        engine: &mut dyn PositioningEngine,
        client: &str,
        timeout_ms: u32,
        qos: FixQos,
    ) -> Vec<Delivery> {
        if self.requests.remove(client).is_some() {
            debug!("{}: replacing outstanding {} fix request", client, self.flavor.as_str());
        }

        if Self::is_cancellation(self.flavor, timeout_ms, &qos) {
            debug!("{}: {} fix request cancelled", client, self.flavor.as_str());
            return self.reevaluate(engine);
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let timer = Timer::start(
            Duration::from_millis(u64::from(timeout_ms)),
            self.queue.clone(),
            BrokerEvent::FixTimeout { flavor: self.flavor, client: client.to_string(), generation },
        );
        self.requests.insert(client.to_string(), FixRequest { qos, generation, timer });
        debug!(
            "{}: {} fix requested (timeout {}ms, {} outstanding)",
            client,
            self.flavor.as_str(),
            timeout_ms,
            self.requests.len()
        );
        self.reevaluate(engine)
    }

    /// A fix from the pooled session: answer every request it satisfies.
    pub fn on_location(&mut self, engine: &mut dyn PositioningEngine, location: &Location) -> Vec<Delivery> {
        if self.pool.is_none() {
            debug!("Dropping {} pooled fix with no active pool", self.flavor.as_str());
            return Vec::new();
        }
        self.last_location = Some(*location);

        let mut satisfied: Vec<String> = self
            .requests
            .iter()
            .filter(|(_, request)| self.satisfies(&request.qos, location))
            .map(|(name, _)| name.clone())
            .collect();
        satisfied.sort();

        let mut deliveries = Vec::with_capacity(satisfied.len());
        for name in satisfied {
            if let Some(request) = self.requests.remove(&name) {
                request.timer.cancel();
                deliveries.push((
                    name,
                    Indication::SingleFix {
                        flavor: self.flavor,
                        status: LocationError::Success,
                        location: *location,
                    },
                ));
            }
        }
        deliveries.extend(self.reevaluate(engine));
        deliveries
    }

    /// Expiry of a request timer. Stale fires (request already answered or
    /// replaced) are ignored.
    pub fn on_timeout(&mut self, engine: &mut dyn PositioningEngine, client: &str, generation: u64) -> Vec<Delivery> {
        match self.requests.get(client) {
            Some(request) if request.generation == generation => {}
            _ => {
                debug!("{}: stale {} fix timer ignored", client, self.flavor.as_str());
                return Vec::new();
            }
        }
        self.requests.remove(client);

        // Only the fused flavor reports its best effort.
        let location = match self.flavor {
            FixFlavor::Fused => self.last_location.unwrap_or_else(Location::empty),
            FixFlavor::Terrestrial => Location::empty(),
        };
        info!("{}: {} fix timed out", client, self.flavor.as_str());
        let mut deliveries = vec![(
            client.to_string(),
            Indication::SingleFix { flavor: self.flavor, status: LocationError::Timeout, location },
        )];
        deliveries.extend(self.reevaluate(engine));
        deliveries
    }

    /// Drop a client's request without answering it (deregistration).
    pub fn remove_client(&mut self, engine: &mut dyn PositioningEngine, client: &str) -> bool {
        let removed = self.requests.remove(client).is_some();
        if removed {
            debug!("{}: {} fix request dropped", client, self.flavor.as_str());
        }
        // A failed pool restart cannot happen here: removal only ever stops.
        let _ = self.reevaluate(engine);
        removed
    }

    /// Start or stop the pooled session so that it is active exactly while
    /// requests are outstanding. A terrestrial pool is restarted when a new
    /// request asks for technologies the running session was not started with.
    fn reevaluate(&mut self, engine: &mut dyn PositioningEngine) -> Vec<Delivery> {
        let tech_mask = self.requests.values().fold(0, |mask, r| mask | r.qos.tech_mask);
        match (self.requests.is_empty(), self.pool) {
            (true, Some(_)) => {
                self.stop_pool(engine);
                self.last_location = None;
                Vec::new()
            }
            (false, None) => self.start_pool(engine, tech_mask),
            (false, Some(session)) if tech_mask & !self.pool_tech_mask != 0 => {
                info!(
                    "Widening {} pooled session {} to tech mask {:#x}",
                    self.flavor.as_str(),
                    session,
                    tech_mask
                );
                self.stop_pool(engine);
                self.start_pool(engine, tech_mask)
            }
            _ => Vec::new(),
        }
    }

    fn start_pool(&mut self, engine: &mut dyn PositioningEngine, tech_mask: u32) -> Vec<Delivery> {
        let params = PooledSessionParams { interval_ms: self.pooled_interval_ms, tech_mask };
        match EngineTicket::from_raw(engine.start_pooled_session(self.flavor, params)) {
            EngineTicket::Issued(session) => {
                self.pool = Some(session);
                self.pool_tech_mask = tech_mask;
                info!("Started {} pooled session {}", self.flavor.as_str(), session);
                Vec::new()
            }
            EngineTicket::Rejected => {
                warn!("Engine refused the {} pooled session", self.flavor.as_str());
                self.fail_all()
            }
        }
    }

    fn stop_pool(&mut self, engine: &mut dyn PositioningEngine) {
        if let Some(session) = self.pool.take() {
            engine.stop_pooled_session(self.flavor, session);
            self.pool_tech_mask = 0;
            info!("Stopped {} pooled session {}", self.flavor.as_str(), session);
        }
    }

    fn fail_all(&mut self) -> Vec<Delivery> {
        let mut names: Vec<String> = self.requests.keys().cloned().collect();
        names.sort();
        self.requests.clear();
        names
            .into_iter()
            .map(|name| {
                (
                    name,
                    Indication::SingleFix {
                        flavor: self.flavor,
                        status: LocationError::GeneralFailure,
                        location: Location::empty(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{Call, RecordingEngine};
    use lh_protocol::LocationFlags;
    use tokio::sync::mpsc;

    fn arbiter(flavor: FixFlavor) -> (SingleShotFixArbiter, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SingleShotFixArbiter::new(flavor, 1000, tx), rx)
    }

    fn fused(accuracy_m: f32) -> FixQos {
        FixQos { accuracy_m, tech_mask: 0 }
    }

    fn fix(accuracy: f32) -> Location {
        Location {
            flags: LocationFlags::HAS_LAT_LONG | LocationFlags::HAS_ACCURACY,
            timestamp_ms: 1_700_000_000_000,
            latitude: 37.42,
            longitude: -122.08,
            accuracy,
            ..Location::default()
        }
    }

    fn assert_pool_invariant(arbiter: &SingleShotFixArbiter) {
        assert_eq!(arbiter.is_pool_active(), arbiter.outstanding() > 0);
    }

    async fn next_timeout(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> (String, u64) {
        match rx.recv().await {
            Some(BrokerEvent::FixTimeout { client, generation, .. }) => (client, generation),
            other => panic!("expected a fix timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fused_fix_satisfied_then_pool_stops() {
        let (mut arbiter, _rx) = arbiter(FixFlavor::Fused);
        let mut engine = RecordingEngine::new();

        assert!(arbiter.request(&mut engine, "app1", 5000, fused(50.0)).is_empty());
        assert_pool_invariant(&arbiter);
        assert!(arbiter.is_pool_active());

        let deliveries = arbiter.on_location(&mut engine, &fix(30.0));
        assert_eq!(
            deliveries,
            vec![(
                "app1".to_string(),
                Indication::SingleFix {
                    flavor: FixFlavor::Fused,
                    status: LocationError::Success,
                    location: fix(30.0),
                }
            )]
        );
        assert!(!arbiter.is_pool_active());
        assert_pool_invariant(&arbiter);
        assert_eq!(engine.calls().last(), Some(&Call::StopPool(FixFlavor::Fused, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_matching_threshold_is_satisfied() {
        let (mut arbiter, _rx) = arbiter(FixFlavor::Fused);
        let mut engine = RecordingEngine::new();

        arbiter.request(&mut engine, "coarse", 5000, fused(50.0));
        arbiter.request(&mut engine, "fine", 5000, fused(10.0));
        assert_eq!(engine.count(|c| matches!(c, Call::StartPool(..))), 1);

        let deliveries = arbiter.on_location(&mut engine, &fix(20.0));
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, "coarse");
        assert!(arbiter.has_request("fine"));
        assert!(arbiter.is_pool_active());
        assert_pool_invariant(&arbiter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unqualified_fix_does_not_satisfy() {
        let (mut arbiter, _rx) = arbiter(FixFlavor::Fused);
        let mut engine = RecordingEngine::new();
        arbiter.request(&mut engine, "app1", 5000, fused(50.0));

        let mut no_time = fix(5.0);
        no_time.timestamp_ms = 0;
        assert!(arbiter.on_location(&mut engine, &no_time).is_empty());
        assert!(arbiter.on_location(&mut engine, &fix(50.0)).is_empty());
        assert!(arbiter.has_request("app1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terrestrial_timeout_carries_empty_location() {
        let (mut arbiter, mut rx) = arbiter(FixFlavor::Terrestrial);
        let mut engine = RecordingEngine::new();
        arbiter.request(&mut engine, "app1", 1000, FixQos { accuracy_m: 0.0, tech_mask: 0x4 });
        assert_eq!(
            engine.calls(),
            vec![Call::StartPool(
                FixFlavor::Terrestrial,
                PooledSessionParams { interval_ms: 1000, tech_mask: 0x4 }
            )]
        );

        tokio::time::advance(Duration::from_millis(1000)).await;
        let (client, generation) = next_timeout(&mut rx).await;
        let deliveries = arbiter.on_timeout(&mut engine, &client, generation);

        assert_eq!(
            deliveries,
            vec![(
                "app1".to_string(),
                Indication::SingleFix {
                    flavor: FixFlavor::Terrestrial,
                    status: LocationError::Timeout,
                    location: Location::empty(),
                }
            )]
        );
        assert!(!arbiter.is_pool_active());
        assert_pool_invariant(&arbiter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fused_timeout_carries_best_effort_location() {
        let (mut arbiter, mut rx) = arbiter(FixFlavor::Fused);
        let mut engine = RecordingEngine::new();
        arbiter.request(&mut engine, "app1", 2000, fused(5.0));
        arbiter.on_location(&mut engine, &fix(80.0));

        tokio::time::advance(Duration::from_millis(2000)).await;
        let (client, generation) = next_timeout(&mut rx).await;
        let deliveries = arbiter.on_timeout(&mut engine, &client, generation);
        assert!(matches!(
            &deliveries[..],
            [(_, Indication::SingleFix { status: LocationError::Timeout, location, .. })] if location.accuracy == 80.0
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_request_cancels() {
        let (mut arbiter, mut rx) = arbiter(FixFlavor::Fused);
        let mut engine = RecordingEngine::new();
        arbiter.request(&mut engine, "app1", 5000, fused(50.0));

        assert!(arbiter.request(&mut engine, "app1", 0, fused(0.0)).is_empty());
        assert_eq!(arbiter.outstanding(), 0);
        assert_pool_invariant(&arbiter);

        // The cancelled request's timer never fires.
        tokio::time::advance(Duration::from_millis(6000)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fused_zero_accuracy_only_cancels() {
        let (mut arbiter, _rx) = arbiter(FixFlavor::Fused);
        let mut engine = RecordingEngine::new();

        assert!(arbiter.request(&mut engine, "app1", 5000, fused(0.0)).is_empty());
        assert_eq!(arbiter.outstanding(), 0);
        assert!(!arbiter.is_pool_active());
        assert_eq!(engine.count(|c| matches!(c, Call::StartPool(..))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fused_zero_timeout_only_cancels() {
        let (mut arbiter, mut rx) = arbiter(FixFlavor::Fused);
        let mut engine = RecordingEngine::new();
        arbiter.request(&mut engine, "app1", 5000, fused(50.0));

        assert!(arbiter.request(&mut engine, "app1", 0, fused(50.0)).is_empty());
        assert_eq!(arbiter.outstanding(), 0);
        assert_pool_invariant(&arbiter);

        tokio::time::advance(Duration::from_millis(6000)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terrestrial_timeout_ignores_positionless_update() {
        let (mut arbiter, mut rx) = arbiter(FixFlavor::Terrestrial);
        let mut engine = RecordingEngine::new();
        arbiter.request(&mut engine, "app1", 1000, FixQos { accuracy_m: 0.0, tech_mask: 0x1 });

        let accuracy_only = Location {
            flags: LocationFlags::HAS_ACCURACY,
            timestamp_ms: 5,
            accuracy: 900.0,
            ..Location::default()
        };
        assert!(arbiter.on_location(&mut engine, &accuracy_only).is_empty());

        tokio::time::advance(Duration::from_millis(1000)).await;
        let (client, generation) = next_timeout(&mut rx).await;
        assert_eq!(
            arbiter.on_timeout(&mut engine, &client, generation),
            vec![(
                "app1".to_string(),
                Indication::SingleFix {
                    flavor: FixFlavor::Terrestrial,
                    status: LocationError::Timeout,
                    location: Location::empty(),
                }
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terrestrial_pool_restarts_when_mask_widens() {
        let (mut arbiter, _rx) = arbiter(FixFlavor::Terrestrial);
        let mut engine = RecordingEngine::new();
        let terrestrial = |tech_mask| FixQos { accuracy_m: 0.0, tech_mask };

        arbiter.request(&mut engine, "app1", 5000, terrestrial(0x1));
        arbiter.request(&mut engine, "app2", 5000, terrestrial(0x4));
        // Already covered by the running session.
        arbiter.request(&mut engine, "app3", 5000, terrestrial(0x1));

        assert_eq!(
            engine.calls(),
            vec![
                Call::StartPool(FixFlavor::Terrestrial, PooledSessionParams { interval_ms: 1000, tech_mask: 0x1 }),
                Call::StopPool(FixFlavor::Terrestrial, 1),
                Call::StartPool(FixFlavor::Terrestrial, PooledSessionParams { interval_ms: 1000, tech_mask: 0x5 }),
            ]
        );
        assert_eq!(arbiter.outstanding(), 3);
        assert_pool_invariant(&arbiter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_request_answers_once() {
        let (mut arbiter, mut rx) = arbiter(FixFlavor::Fused);
        let mut engine = RecordingEngine::new();
        arbiter.request(&mut engine, "app1", 1000, fused(50.0));
        arbiter.request(&mut engine, "app1", 3000, fused(50.0));
        assert_eq!(arbiter.outstanding(), 1);
        assert_eq!(engine.count(|c| matches!(c, Call::StartPool(..))), 1);

        // Only the replacement's timer fires.
        tokio::time::advance(Duration::from_millis(3000)).await;
        let (client, generation) = next_timeout(&mut rx).await;
        assert_eq!(arbiter.on_timeout(&mut engine, &client, generation).len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_after_fulfilment_is_ignored() {
        let (mut arbiter, _rx) = arbiter(FixFlavor::Fused);
        let mut engine = RecordingEngine::new();
        arbiter.request(&mut engine, "app1", 1000, fused(50.0));
        assert_eq!(arbiter.on_location(&mut engine, &fix(1.0)).len(), 1);

        // A fire that raced the fix finds nothing to act on.
        assert!(arbiter.on_timeout(&mut engine, "app1", 1).is_empty());
        assert_pool_invariant(&arbiter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_client_stops_pool() {
        let (mut arbiter, _rx) = arbiter(FixFlavor::Terrestrial);
        let mut engine = RecordingEngine::new();
        arbiter.request(&mut engine, "app1", 1000, FixQos { accuracy_m: 0.0, tech_mask: 1 });

        assert!(arbiter.remove_client(&mut engine, "app1"));
        assert!(!arbiter.remove_client(&mut engine, "app1"));
        assert!(!arbiter.is_pool_active());
    }
}
