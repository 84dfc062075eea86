//! Routes asynchronous engine configuration answers back to the client that
//! asked. Every entry is delivered at most once.

use std::collections::HashMap;

use tracing::{debug, warn};

use lh_protocol::{EngineConfig, Indication, LocationError, RequestKind};

use crate::arbiter::Delivery;
use crate::engine::{EngineTicket, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRequestEntry {
    pub client: String,
    pub request: RequestKind,
}

/// What the engine answered for one config session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigResult {
    pub status: LocationError,
    /// Values for getter requests, delivered as a second message
    pub config: Option<EngineConfig>,
}

impl ConfigResult {
    pub fn status(status: LocationError) -> Self {
        Self { status, config: None }
    }

    pub fn values(config: EngineConfig) -> Self {
        Self { status: LocationError::Success, config: Some(config) }
    }
}

#[derive(Debug, Default)]
pub struct ConfigRequestCorrelator {
    pending: HashMap<SessionId, ConfigRequestEntry>,
}

impl ConfigRequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember who issued `ticket`. A rejected ticket stores nothing and
    /// yields the general-failure response owed to the client right away.
    pub fn track(&mut self, ticket: EngineTicket, client: &str, request: RequestKind) -> Option<Delivery> {
        match ticket {
            EngineTicket::Rejected => {
                warn!("{}: engine rejected {:?} immediately", client, request);
                Some((client.to_string(), Indication::response(request, LocationError::GeneralFailure)))
            }
            EngineTicket::Issued(session) => {
                let entry = ConfigRequestEntry { client: client.to_string(), request };
                if let Some(previous) = self.pending.insert(session, entry) {
                    // The engine must not reuse a live id; the newer request wins.
                    warn!(
                        "Engine reused config session {} (was {} {:?})",
                        session, previous.client, previous.request
                    );
                }
                debug!("{}: {:?} waiting on config session {}", client, request, session);
                None
            }
        }
    }

    /// Consume the entry for `session`. Unknown, late, or duplicate
    /// sessions deliver nothing.
    pub fn resolve(&mut self, session: u32, result: ConfigResult) -> Vec<Delivery> {
        let entry = SessionId::new(session).and_then(|id| self.pending.remove(&id));
        let Some(entry) = entry else {
            debug!("No config request waiting on session {}, dropping", session);
            return Vec::new();
        };

        let mut deliveries = vec![(
            entry.client.clone(),
            Indication::response(entry.request, result.status),
        )];
        if let Some(config) = result.config {
            deliveries.push((entry.client, Indication::Config { request: entry.request, config }));
        }
        deliveries
    }

    pub fn is_pending(&self, session: u32) -> bool {
        SessionId::new(session).is_some_and(|id| self.pending.contains_key(&id))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
