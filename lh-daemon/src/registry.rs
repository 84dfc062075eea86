//! Client registry: the only owner of [`ClientHandle`]s.

use std::collections::HashMap;

use tracing::{debug, info};

use lh_protocol::{CapabilityMask, ClientKind};

use crate::arbiter::SingleShotFixArbiter;
use crate::client::{ClientHandle, ClientLink, EngineInfoRequest};
use crate::engine::PositioningEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// The name was already registered; capabilities were re-sent
    Existing,
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<String, ClientHandle>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, or re-advertise capabilities to an existing client.
    /// A re-registration over a new connection moves the client onto it.
    pub fn register(
        &mut self,
        name: &str,
        kind: ClientKind,
        link: ClientLink,
        capabilities: CapabilityMask,
    ) -> Registration {
        if let Some(existing) = self.clients.get_mut(name) {
            if !link.is_detached() && !existing.link().same_connection(&link) {
                debug!("{}: re-registered over connection {}", name, link.connection());
                existing.rebind(link);
            }
            existing.send_capabilities(capabilities);
            return Registration::Existing;
        }

        let mut handle = ClientHandle::new(name, kind, link);
        handle.send_capabilities(capabilities);
        self.clients.insert(name.to_string(), handle);
        info!("Registered client {} ({:?}), {} total", name, kind, self.clients.len());
        Registration::Created
    }

    /// Tear a client down: pending single-shot requests first, then its
    /// engine sessions and geofences, then the handle itself.
    /// Returns false if the name was not registered.
    pub fn deregister(
        &mut self,
        name: &str,
        engine: &mut dyn PositioningEngine,
        arbiters: [&mut SingleShotFixArbiter; 2],
    ) -> bool {
        let Some(handle) = self.clients.get_mut(name) else {
            debug!("Deregister for unknown client {}", name);
            return false;
        };

        for arbiter in arbiters {
            arbiter.remove_client(engine, name);
        }
        handle.release(engine);
        self.clients.remove(name);
        info!("Deregistered client {}, {} remaining", name, self.clients.len());
        true
    }

    pub fn lookup(&self, name: &str) -> Option<&ClientHandle> {
        self.clients.get(name)
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut ClientHandle> {
        self.clients.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot of registered names, sorted for deterministic fan-out
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    /// Visit the clients present when the call started, in name order.
    pub fn for_each(&mut self, mut visit: impl FnMut(&mut ClientHandle)) {
        for name in self.names() {
            if let Some(handle) = self.clients.get_mut(&name) {
                visit(handle);
            }
        }
    }

    /// Names and links of every client that has a transport to probe
    pub fn probe_targets(&self) -> Vec<(String, ClientLink)> {
        let mut targets: Vec<(String, ClientLink)> = self
            .clients
            .values()
            .filter(|handle| !handle.link().is_detached())
            .map(|handle| (handle.name().to_string(), handle.link().clone()))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        targets
    }

    /// Names of clients whose transport failed during the last handler
    pub fn gone_clients(&self) -> Vec<String> {
        let mut gone: Vec<String> = self
            .clients
            .values()
            .filter(|handle| handle.is_gone())
            .map(|handle| handle.name().to_string())
            .collect();
        gone.sort();
        gone
    }

    /// Whether any client other than `except` already waits on `request`
    pub fn any_pending_engine_info(&self, request: EngineInfoRequest, except: &str) -> bool {
        self.clients
            .values()
            .any(|h| h.name() != except && h.pending_engine_info().contains(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{Call, RecordingEngine};
    use lh_protocol::{FixFlavor, Indication};
    use tokio::sync::mpsc;

    fn link(connection: u64) -> (ClientLink, mpsc::UnboundedReceiver<Indication>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientLink::connected(connection, tx), rx)
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let mut registry = ClientRegistry::new();
        let (l, mut rx) = link(1);
        let caps = CapabilityMask::GEOFENCE;

        assert_eq!(registry.register("app1", ClientKind::LocationClientApi, l.clone(), caps), Registration::Created);
        assert_eq!(registry.register("app1", ClientKind::LocationClientApi, l, caps), Registration::Existing);
        assert_eq!(registry.len(), 1);

        let mut adverts = 0;
        while let Ok(Indication::Capabilities { .. }) = rx.try_recv() {
            adverts += 1;
        }
        assert_eq!(adverts, 2);
    }

    #[test]
    fn test_reregistration_moves_to_new_connection() {
        let mut registry = ClientRegistry::new();
        let (old, _old_rx) = link(1);
        let (new, mut new_rx) = link(2);

        registry.register("app1", ClientKind::LocationClientApi, old, CapabilityMask::empty());
        registry.register("app1", ClientKind::LocationClientApi, new, CapabilityMask::empty());

        assert_eq!(registry.lookup("app1").map(|h| h.link().connection()), Some(2));
        assert!(matches!(new_rx.try_recv(), Ok(Indication::Capabilities { .. })));
    }

    #[tokio::test]
    async fn test_deregister_unknown_is_noop() {
        let mut registry = ClientRegistry::new();
        let mut engine = RecordingEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut terrestrial = SingleShotFixArbiter::new(FixFlavor::Terrestrial, 1000, tx.clone());
        let mut fused = SingleShotFixArbiter::new(FixFlavor::Fused, 1000, tx);

        assert!(!registry.deregister("ghost", &mut engine, [&mut terrestrial, &mut fused]));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deregister_releases_sessions() {
        let mut registry = ClientRegistry::new();
        let mut engine = RecordingEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut terrestrial = SingleShotFixArbiter::new(FixFlavor::Terrestrial, 1000, tx.clone());
        let mut fused = SingleShotFixArbiter::new(FixFlavor::Fused, 1000, tx);
        let (l, _client_rx) = link(1);

        registry.register("app1", ClientKind::LocationClientApi, l, CapabilityMask::empty());
        let client = registry.lookup_mut("app1").unwrap();
        client.start_tracking(
            &mut engine,
            lh_protocol::TrackingOptions { min_interval_ms: 1000, min_distance_m: 0, mode: Default::default() },
            None,
        );

        assert!(registry.deregister("app1", &mut engine, [&mut terrestrial, &mut fused]));
        assert!(!registry.contains("app1"));
        assert_eq!(engine.calls().last(), Some(&Call::StopTracking(1)));
    }

    #[test]
    fn test_for_each_snapshot_and_probe_targets() {
        let mut registry = ClientRegistry::new();
        let (a, _ra) = link(1);
        let (b, _rb) = link(2);
        registry.register("b", ClientKind::LocationClientApi, b, CapabilityMask::empty());
        registry.register("a", ClientKind::LocationClientApi, a, CapabilityMask::empty());
        registry.register("default", ClientKind::LocationClientApi, ClientLink::detached(), CapabilityMask::empty());

        let mut visited = Vec::new();
        registry.for_each(|h| visited.push(h.name().to_string()));
        assert_eq!(visited, vec!["a", "b", "default"]);

        let targets: Vec<String> = registry.probe_targets().into_iter().map(|(n, _)| n).collect();
        assert_eq!(targets, vec!["a", "b"]);
    }
}
