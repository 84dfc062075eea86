//! Session broker
//!
//! All broker state lives in one [`Broker`] behind one async mutex
//! ([`SharedBroker`]). Connection handlers lock it per inbound message; the
//! event pump locks it per engine callback or timer fire. Handlers therefore
//! never interleave their map mutations.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lh_protocol::{
    CallbackMask, ClientKind, ConfigCommand, FixFlavor, Indication, LocationError, PositionMode,
    RequestKind, TrackingOptions, AUTO_START_CLIENT_NAME,
};

use crate::arbiter::{Delivery, SingleShotFixArbiter};
use crate::client::{ClientLink, EngineInfoRequest};
use crate::config::{AutoStartConfig, DaemonConfig};
use crate::correlator::{ConfigRequestCorrelator, ConfigResult};
use crate::engine::{EngineEvent, EngineTicket, PositioningEngine, SessionId};
use crate::registry::ClientRegistry;

/// Everything processed in the broker's serialized context besides inbound
/// client messages
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Engine(EngineEvent),
    FixTimeout { flavor: FixFlavor, client: String, generation: u64 },
}

pub type SharedBroker = Arc<Mutex<Broker>>;

pub struct Broker {
    pub(crate) engine: Box<dyn PositioningEngine>,
    pub(crate) registry: ClientRegistry,
    pub(crate) correlator: ConfigRequestCorrelator,
    pub(crate) terrestrial: SingleShotFixArbiter,
    pub(crate) fused: SingleShotFixArbiter,
    /// Clients that opted in to unsolicited XTRA status reports
    pub(crate) xtra_clients: BTreeSet<String>,
    pub(crate) terrestrial_consent: bool,
    pub(crate) require_terrestrial_consent: bool,
    pub(crate) master_position_mode: Option<PositionMode>,
}

impl Broker {
    pub fn new(
        mut engine: Box<dyn PositioningEngine>,
        config: &DaemonConfig,
        queue: UnboundedSender<BrokerEvent>,
    ) -> Self {
        engine.enable();
        Self {
            engine,
            registry: ClientRegistry::new(),
            correlator: ConfigRequestCorrelator::new(),
            terrestrial: SingleShotFixArbiter::new(
                FixFlavor::Terrestrial,
                config.pooled_fix_interval_ms,
                queue.clone(),
            ),
            fused: SingleShotFixArbiter::new(FixFlavor::Fused, config.pooled_fix_interval_ms, queue),
            xtra_clients: BTreeSet::new(),
            terrestrial_consent: false,
            require_terrestrial_consent: config.require_terrestrial_consent,
            master_position_mode: config.master_position_mode(),
        }
    }

    pub fn into_shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &ConfigRequestCorrelator {
        &self.correlator
    }

    pub fn arbiter(&self, flavor: FixFlavor) -> &SingleShotFixArbiter {
        match flavor {
            FixFlavor::Terrestrial => &self.terrestrial,
            FixFlavor::Fused => &self.fused,
        }
    }

    pub fn xtra_clients(&self) -> &BTreeSet<String> {
        &self.xtra_clients
    }

    pub fn terrestrial_consent(&self) -> bool {
        self.terrestrial_consent
    }

    /// Send each message to its client if it is still registered.
    pub(crate) fn deliver(&mut self, deliveries: Vec<Delivery>) {
        for (name, indication) in deliveries {
            match self.registry.lookup_mut(&name) {
                Some(client) => {
                    client.send(indication);
                }
                None => debug!("{} for {} dropped, client is gone", indication.type_name(), name),
            }
        }
    }

    pub(crate) fn respond(&mut self, name: &str, request: RequestKind, status: LocationError) {
        self.deliver(vec![(name.to_string(), Indication::response(request, status))]);
    }

    /// Full cleanup of one client. Safe to call for a name that is already gone.
    pub fn deregister_client(&mut self, name: &str) -> bool {
        let removed = self.registry.deregister(
            name,
            self.engine.as_mut(),
            [&mut self.terrestrial, &mut self.fused],
        );
        if self.xtra_clients.remove(name) && self.xtra_clients.is_empty() {
            debug!("Last XTRA status subscriber left");
            // Nobody is left to receive the answer.
            match EngineTicket::from_raw(self.engine.configure(&ConfigCommand::DeregisterXtraStatusUpdates))
                .session()
            {
                Some(session) => debug!("XTRA status updates deregistered, session {}", session),
                None => debug!("Engine rejected XTRA status deregistration"),
            }
        }
        removed
    }

    /// Deregister every client whose transport failed while handling the
    /// last message or event.
    pub(crate) fn reap_dead_clients(&mut self) {
        for name in self.registry.gone_clients() {
            info!("Client {} transport closed, cleaning up", name);
            self.deregister_client(&name);
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Engine(event) => self.handle_engine_event(event),
            BrokerEvent::FixTimeout { flavor, client, generation } => {
                let arbiter = match flavor {
                    FixFlavor::Terrestrial => &mut self.terrestrial,
                    FixFlavor::Fused => &mut self.fused,
                };
                let deliveries = arbiter.on_timeout(self.engine.as_mut(), &client, generation);
                self.deliver(deliveries);
            }
        }
        self.reap_dead_clients();
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        debug!("Engine event {}", event.type_name());
        match event {
            EngineEvent::SessionResponse { session, status } => {
                let Some(session) = SessionId::new(session) else {
                    warn!("Session response without a session id, dropping");
                    return;
                };
                let mut claimed = false;
                self.registry.for_each(|client| {
                    if !claimed && client.on_session_response(session, status) {
                        claimed = true;
                    }
                });
                if !claimed {
                    debug!("No request waiting on session {}, dropping response", session);
                }
            }

            EngineEvent::GeofenceResponse { results } => {
                let mut claimed = 0;
                self.registry.for_each(|client| {
                    let mine: Vec<_> = results
                        .iter()
                        .filter(|r| client.owns_pending_fence(r.session))
                        .copied()
                        .collect();
                    if !mine.is_empty() {
                        claimed += mine.len();
                        client.on_geofence_response(&mine);
                    }
                });
                if claimed < results.len() {
                    debug!("{} geofence results had no owner", results.len() - claimed);
                }
            }

            EngineEvent::ConfigResponse { session, status } => {
                let deliveries = self.correlator.resolve(session, ConfigResult::status(status));
                self.deliver(deliveries);
            }

            EngineEvent::ConfigCollectiveResponse { results } => {
                if results.len() != 1 {
                    warn!("Collective config response with {} entries, dropping", results.len());
                    return;
                }
                let result = results[0];
                let deliveries = self.correlator.resolve(result.session, ConfigResult::status(result.status));
                self.deliver(deliveries);
            }

            EngineEvent::ConfigValue { session: 0, config } => match config.xtra_status {
                Some(status) => {
                    let subscribers: Vec<Delivery> = self
                        .xtra_clients
                        .iter()
                        .map(|name| (name.clone(), Indication::XtraStatus { status }))
                        .collect();
                    debug!("XTRA status broadcast to {} clients", subscribers.len());
                    self.deliver(subscribers);
                }
                None => debug!("Unsolicited config value without XTRA status, dropping"),
            },

            EngineEvent::ConfigValue { session, config } => {
                let deliveries = self.correlator.resolve(session, ConfigResult::values(config));
                self.deliver(deliveries);
            }

            EngineEvent::TrackingLocation { info } => {
                self.registry.for_each(|client| {
                    if client.tracking_session().is_none() {
                        return;
                    }
                    let callbacks = client.callbacks();
                    if callbacks.contains(CallbackMask::TRACKING) {
                        client.send(Indication::Location { location: info.location });
                    }
                    if callbacks.contains(CallbackMask::LOCATION_INFO) {
                        client.send(Indication::LocationInfo { info });
                    }
                });
            }

            EngineEvent::EngineLocations { locations } => {
                self.registry.for_each(|client| {
                    if client.tracking_session().is_some()
                        && client.callbacks().contains(CallbackMask::ENGINE_LOCATIONS)
                    {
                        client.send(Indication::EngineLocations { locations: locations.clone() });
                    }
                });
            }

            EngineEvent::BatchedLocations { session, locations, complete } => {
                let mut locations = Some(locations);
                self.registry.for_each(|client| {
                    let owns = client.batching_session().is_some_and(|b| b.session.get() == session);
                    if owns && client.callbacks().contains(CallbackMask::BATCHING) {
                        if let Some(locations) = locations.take() {
                            client.send(Indication::BatchedLocations { locations, complete });
                        }
                    }
                });
            }

            EngineEvent::GeofenceBreach { sessions, location, breach, timestamp_ms } => {
                self.registry.for_each(|client| {
                    if !client.callbacks().contains(CallbackMask::GEOFENCE_BREACH) {
                        return;
                    }
                    let ids = client.fence_ids_for(&sessions);
                    if !ids.is_empty() {
                        client.send(Indication::GeofenceBreach { ids, location, breach, timestamp_ms });
                    }
                });
            }

            EngineEvent::PooledLocation { flavor, location } => {
                let arbiter = match flavor {
                    FixFlavor::Terrestrial => &mut self.terrestrial,
                    FixFlavor::Fused => &mut self.fused,
                };
                let deliveries = arbiter.on_location(self.engine.as_mut(), &location);
                self.deliver(deliveries);
            }

            EngineEvent::EnergyConsumed { total_energy_uws } => {
                self.registry.for_each(|client| {
                    if client.take_engine_info_pending(EngineInfoRequest::ENERGY_CONSUMED) {
                        client.send(Indication::EnergyConsumed { total_energy_uws });
                    }
                });
            }

            EngineEvent::AntennaInfo { antennas } => {
                self.registry.for_each(|client| {
                    if client.take_engine_info_pending(EngineInfoRequest::ANTENNA_INFO) {
                        client.send(Indication::AntennaInfo { antennas: antennas.clone() });
                    }
                });
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create the daemon's own client and start its tracking session.
    pub fn start_default_client(&mut self, auto_start: &AutoStartConfig) {
        if auto_start.delete_aiding_data_before_start {
            let ticket =
                EngineTicket::from_raw(self.engine.delete_aiding_data(auto_start.aiding_data_engine_mask));
            if ticket == EngineTicket::Rejected {
                warn!("Engine refused to delete aiding data before auto-start");
            }
        }

        let capabilities = self.engine.capabilities();
        self.registry.register(
            AUTO_START_CLIENT_NAME,
            ClientKind::LocationClientApi,
            ClientLink::detached(),
            capabilities,
        );

        let options = TrackingOptions {
            min_interval_ms: auto_start.interval_ms,
            min_distance_m: 0,
            mode: auto_start.position_mode,
        };
        let master = self.master_position_mode;
        let engine = self.engine.as_mut();
        if let Some(client) = self.registry.lookup_mut(AUTO_START_CLIENT_NAME) {
            client.set_callbacks(CallbackMask::LOCATION_INFO | CallbackMask::SATELLITES);
            client.start_tracking(engine, options, master);
            info!("Auto-started tracking every {}ms", auto_start.interval_ms);
        }
    }

    /// Clean up every client and disable the engine.
    pub fn shutdown(&mut self) {
        let names = self.registry.names();
        info!("Shutting down broker ({} clients)", names.len());
        for name in names {
            self.deregister_client(&name);
        }
        self.engine.disable();
    }
}

/// Drain the event queue into the broker, one event per lock.
pub async fn run_event_pump(broker: SharedBroker, mut events: UnboundedReceiver<BrokerEvent>) {
    while let Some(event) = events.recv().await {
        broker.lock().await.handle_event(event);
    }
    debug!("Broker event queue closed");
}
