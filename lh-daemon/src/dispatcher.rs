//! Inbound message routing.

use tracing::{debug, info, warn};

use lh_error::{LocHalError, Result};
use lh_protocol::{
    ConfigCommand, FixFlavor, Indication, Location, LocationError, Request, RequestEnvelope,
    AUTO_START_CLIENT_NAME, MAX_MESSAGE_SIZE,
};

use crate::arbiter::{FixQos, SingleShotFixArbiter};
use crate::broker::Broker;
use crate::client::{ClientLink, EngineInfoRequest};
use crate::engine::EngineTicket;

impl Broker {
    /// Decode one line from `origin` and route it. Lines that fail to
    /// decode or to route are dropped with a warning; no reply is sent.
    pub fn dispatch(&mut self, raw: &str, origin: &ClientLink) {
        let result = decode_request(raw).and_then(|envelope| {
            debug!("{} from {}", envelope.request.type_name(), envelope.sender);
            self.route(envelope, origin)
        });
        if let Err(e) = result {
            warn!("Dropping message on connection {}: {}", origin.connection(), e);
        }
        self.reap_dead_clients();
    }

    fn route(&mut self, envelope: RequestEnvelope, origin: &ClientLink) -> Result<()> {
        let RequestEnvelope { sender, request } = envelope;

        if let Request::Register { client_kind } = request {
            if sender == AUTO_START_CLIENT_NAME {
                return Err(LocHalError::InvalidRequest {
                    client: sender,
                    reason: "name is reserved for the daemon".into(),
                });
            }
            let capabilities = self.engine.capabilities();
            self.registry.register(&sender, client_kind, origin.clone(), capabilities);
            return Ok(());
        }

        let master = self.master_position_mode;
        let engine = self.engine.as_mut();
        let Some(client) = self.registry.lookup_mut(&sender) else {
            return Err(LocHalError::UnknownClient(sender));
        };
        if !client.link().same_connection(origin) {
            return Err(LocHalError::InvalidRequest {
                client: sender,
                reason: format!("{} sent from another connection", request.type_name()),
            });
        }

        match request {
            Request::Register { .. } => {}
            Request::Deregister => {
                self.deregister_client(&sender);
            }

            Request::StartTracking { options } => client.start_tracking(engine, options, master),
            Request::StopTracking { preserve_subscriptions } => {
                client.stop_tracking(engine, preserve_subscriptions)
            }
            Request::UpdateSubscription { callbacks } => client.update_subscription(callbacks),
            Request::UpdateTrackingOptions { options } => {
                client.update_tracking_options(engine, options, master)
            }

            Request::StartBatching { options } => client.start_batching(engine, options),
            Request::StopBatching => client.stop_batching(engine),
            Request::UpdateBatchingOptions { options } => client.update_batching_options(engine, options),

            Request::AddGeofences { geofences } => client.add_geofences(engine, &geofences),
            Request::RemoveGeofences { ids } => client.remove_geofences(engine, &ids),
            Request::ModifyGeofences { geofences } => client.modify_geofences(engine, &geofences),
            Request::PauseGeofences { ids } => client.pause_geofences(engine, &ids),
            Request::ResumeGeofences { ids } => client.resume_geofences(engine, &ids),

            Request::GetSingleTerrestrialFix { timeout_ms, tech_mask, accuracy_m } => {
                let qos = FixQos { accuracy_m, tech_mask };
                let cancel = SingleShotFixArbiter::is_cancellation(FixFlavor::Terrestrial, timeout_ms, &qos);
                if self.require_terrestrial_consent && !self.terrestrial_consent && !cancel {
                    info!("{}: terrestrial fix refused, no user consent", sender);
                    client.send(Indication::SingleFix {
                        flavor: FixFlavor::Terrestrial,
                        status: LocationError::NotSupported,
                        location: Location::empty(),
                    });
                    return Ok(());
                }
                let deliveries = self.terrestrial.request(engine, &sender, timeout_ms, qos);
                self.deliver(deliveries);
            }
            Request::GetSingleFusedFix { timeout_ms, accuracy_m } => {
                let qos = FixQos { accuracy_m, tech_mask: 0 };
                let deliveries = self.fused.request(engine, &sender, timeout_ms, qos);
                self.deliver(deliveries);
            }

            Request::Config(command) => self.configure(&sender, command),

            Request::UpdateNetworkAvailability { available } => {
                engine.update_network_availability(available)
            }
            Request::InjectLocation { location } => engine.inject_location(&location),

            Request::GetEnergyConsumed => {
                self.request_engine_info(&sender, EngineInfoRequest::ENERGY_CONSUMED)
            }
            Request::GetAntennaInfo => self.request_engine_info(&sender, EngineInfoRequest::ANTENNA_INFO),
            Request::GetDebugReport => {
                let report = engine.debug_report();
                client.send(Indication::DebugReport { report });
            }
            Request::PingTest => {
                client.send(Indication::Pong);
            }
        }
        Ok(())
    }

    fn configure(&mut self, sender: &str, command: ConfigCommand) {
        match command {
            ConfigCommand::UserConsentTerrestrial { consent } => {
                info!("{}: terrestrial positioning consent {}", sender, consent);
                self.terrestrial_consent = consent;
                self.respond(sender, command.kind(), LocationError::Success);
            }
            ConfigCommand::RegisterXtraStatusUpdates => {
                self.xtra_clients.insert(sender.to_string());
                self.issue_config(sender, &command);
            }
            ConfigCommand::DeregisterXtraStatusUpdates => {
                self.xtra_clients.remove(sender);
                if self.xtra_clients.is_empty() {
                    self.issue_config(sender, &command);
                } else {
                    debug!("{} XTRA subscribers remain", self.xtra_clients.len());
                    self.respond(sender, command.kind(), LocationError::Success);
                }
            }
            _ => self.issue_config(sender, &command),
        }
    }

    fn issue_config(&mut self, sender: &str, command: &ConfigCommand) {
        let ticket = EngineTicket::from_raw(self.engine.configure(command));
        if let Some(delivery) = self.correlator.track(ticket, sender, command.kind()) {
            self.deliver(vec![delivery]);
        }
    }

    /// Engine info queries are answered to every waiting client at once, so
    /// the engine is asked only when nobody is already waiting.
    fn request_engine_info(&mut self, sender: &str, request: EngineInfoRequest) {
        let in_flight = self.registry.any_pending_engine_info(request, sender);
        let Some(client) = self.registry.lookup_mut(sender) else {
            return;
        };
        let already_waiting = client.pending_engine_info().contains(request);
        client.mark_engine_info_pending(request);
        if in_flight || already_waiting {
            debug!("{}: joining in-flight {:?} query", sender, request);
            return;
        }
        if request == EngineInfoRequest::ENERGY_CONSUMED {
            self.engine.request_energy_consumed();
        } else {
            self.engine.request_antenna_info();
        }
    }
}

/// Decode one inbound line into a validated request.
pub fn decode_request(raw: &str) -> Result<RequestEnvelope> {
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(LocHalError::MessageTooLarge { size: raw.len(), max_size: MAX_MESSAGE_SIZE });
    }
    RequestEnvelope::decode(raw).map_err(LocHalError::malformed)
}
