//! Location HAL daemon: multi-client session broker
//!
//! Clients connect over a Unix socket, register by name and issue positioning
//! requests. The broker owns per-client session state, forwards requests to
//! the positioning engine, and routes the engine's asynchronous answers back
//! to the right client.

pub mod arbiter;
pub mod broker;
pub mod client;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod engine;
pub mod maintenance;
pub mod registry;
pub mod server;
pub mod timer;

pub use broker::{run_event_pump, Broker, BrokerEvent, SharedBroker};
pub use config::{load_config, AutoStartConfig, DaemonConfig};
pub use engine::{EngineEvent, EngineEventSink, LoopbackEngine, PositioningEngine};
