//! Periodic liveness probing
//!
//! Each cycle pings every connected client and fully deregisters those whose
//! transport refuses the message. Clients hosted by the daemon itself have no
//! transport and are never probed.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use lh_protocol::Indication;

use crate::broker::{Broker, SharedBroker};

/// Run one probe cycle and return the names that were removed.
pub async fn run_cycle(broker: &SharedBroker) -> Vec<String> {
    let targets = broker.lock().await.registry().probe_targets();
    if targets.is_empty() {
        return Vec::new();
    }

    // Sending needs no broker state; the lock is released while probing.
    let failed: Vec<(String, u64)> = targets
        .into_iter()
        .filter(|(name, link)| link.send(name, Indication::Ping).is_err())
        .map(|(name, link)| (name, link.connection()))
        .collect();

    let removed = if failed.is_empty() {
        Vec::new()
    } else {
        remove_failed(&mut *broker.lock().await, failed)
    };
    debug!("Maintenance cycle complete, {} clients removed", removed.len());
    removed
}

/// Deregister clients whose probe failed, unless the name has since been
/// registered again on another connection.
fn remove_failed(broker: &mut Broker, failed: Vec<(String, u64)>) -> Vec<String> {
    let mut removed = Vec::with_capacity(failed.len());
    for (name, connection) in failed {
        let current = broker.registry().lookup(&name).map(|h| h.link().connection());
        if current != Some(connection) {
            debug!("Client {} moved off probed connection {}, keeping it", name, connection);
            continue;
        }
        info!("Client {} failed liveness probe, removing", name);
        broker.deregister_client(&name);
        removed.push(name);
    }
    removed
}

/// Probe every `interval` until the task is aborted. A failed cycle never
/// stops the schedule.
pub fn spawn_maintenance(broker: SharedBroker, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            run_cycle(&broker).await;
        }
    })
}
