//! End-to-end broker behaviour against the loopback engine, driven through
//! raw request lines the way the socket transport feeds them.

use lh_daemon::client::ClientLink;
use lh_daemon::engine::EngineEventSink;
use lh_daemon::{Broker, BrokerEvent, DaemonConfig, LoopbackEngine};
use lh_protocol::{
    CallbackMask, ConfigCommand, EngineConfig, FixFlavor, Indication, Location, LocationError,
    LocationFlags, Request, RequestEnvelope, RequestKind, TrackingOptions,
};
use tokio::sync::mpsc;

struct Daemon {
    broker: Broker,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
}

struct App {
    name: String,
    link: ClientLink,
    rx: mpsc::UnboundedReceiver<Indication>,
}

impl Daemon {
    fn start() -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let engine = LoopbackEngine::new(EngineEventSink::new(tx.clone()));
        let broker = Broker::new(Box::new(engine), &DaemonConfig::default(), tx);
        Self { broker, events }
    }

    fn connect(&mut self, name: &str, connection: u64) -> App {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = App {
            name: name.to_string(),
            link: ClientLink::connected(connection, tx),
            rx,
        };
        self.send(&app, Request::Register { client_kind: Default::default() });
        app
    }

    /// Send one request line and let every resulting engine callback run.
    fn send(&mut self, app: &App, request: Request) {
        let line = serde_json::to_string(&RequestEnvelope::new(&app.name, request)).unwrap();
        self.broker.dispatch(&line, &app.link);
        self.settle();
    }

    fn settle(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.broker.handle_event(event);
        }
    }
}

impl App {
    fn drain(&mut self) -> Vec<Indication> {
        let mut out = Vec::new();
        while let Ok(indication) = self.rx.try_recv() {
            out.push(indication);
        }
        out
    }
}

fn fix(accuracy: f32) -> Location {
    Location {
        flags: LocationFlags::HAS_LAT_LONG | LocationFlags::HAS_ACCURACY,
        timestamp_ms: 1_700_000_000_000,
        latitude: 48.137,
        longitude: 11.575,
        accuracy,
        ..Location::default()
    }
}

fn tracking(min_interval_ms: u32) -> TrackingOptions {
    TrackingOptions { min_interval_ms, min_distance_m: 0, mode: Default::default() }
}

#[tokio::test]
async fn tracking_session_delivers_locations() {
    let mut daemon = Daemon::start();
    let mut app = daemon.connect("nav", 1);
    assert!(matches!(app.drain().as_slice(), [Indication::Capabilities { .. }]));

    daemon.send(&app, Request::UpdateSubscription { callbacks: CallbackMask::TRACKING });
    daemon.send(&app, Request::StartTracking { options: tracking(1000) });
    assert_eq!(
        app.drain(),
        vec![
            Indication::success(RequestKind::UpdateSubscription),
            Indication::success(RequestKind::StartTracking),
        ]
    );

    daemon.send(&app, Request::InjectLocation { location: fix(3.0) });
    assert_eq!(app.drain(), vec![Indication::Location { location: fix(3.0) }]);
}

#[tokio::test]
async fn fused_fix_served_from_pool() {
    let mut daemon = Daemon::start();
    let mut app = daemon.connect("maps", 1);
    let mut feeder = daemon.connect("feeder", 2);
    app.drain();
    feeder.drain();

    daemon.send(&app, Request::GetSingleFusedFix { timeout_ms: 30_000, accuracy_m: 10.0 });
    assert!(daemon.broker.arbiter(FixFlavor::Fused).is_pool_active());

    daemon.send(&feeder, Request::InjectLocation { location: fix(25.0) });
    assert!(app.drain().is_empty());

    daemon.send(&feeder, Request::InjectLocation { location: fix(4.0) });
    assert_eq!(
        app.drain(),
        vec![Indication::SingleFix {
            flavor: FixFlavor::Fused,
            status: LocationError::Success,
            location: fix(4.0),
        }]
    );
    assert!(!daemon.broker.arbiter(FixFlavor::Fused).is_pool_active());
}

#[tokio::test]
async fn config_getter_reflects_setter() {
    let mut daemon = Daemon::start();
    let mut lia = daemon.connect("lia", 1);
    lia.drain();

    daemon.send(&lia, Request::Config(ConfigCommand::MinSvElevation { degrees: 12 }));
    daemon.send(&lia, Request::Config(ConfigCommand::GetMinSvElevation));

    assert_eq!(
        lia.drain(),
        vec![
            Indication::success(RequestKind::ConfigMinSvElevation),
            Indication::success(RequestKind::GetMinSvElevation),
            Indication::Config {
                request: RequestKind::GetMinSvElevation,
                config: EngineConfig { min_sv_elevation: Some(12), ..EngineConfig::default() },
            },
        ]
    );
    assert!(daemon.broker.correlator().is_empty());
}

#[tokio::test]
async fn clients_share_connection_but_not_state() {
    let mut daemon = Daemon::start();
    let mut first = daemon.connect("first", 5);
    let mut second = daemon.connect("second", 5);
    first.drain();
    second.drain();

    daemon.send(&first, Request::UpdateSubscription { callbacks: CallbackMask::TRACKING });
    daemon.send(&first, Request::StartTracking { options: tracking(500) });
    first.drain();

    daemon.send(&second, Request::InjectLocation { location: fix(1.0) });
    assert_eq!(first.drain(), vec![Indication::Location { location: fix(1.0) }]);
    assert!(second.drain().is_empty());

    daemon.send(&first, Request::Deregister);
    assert_eq!(daemon.broker.registry().names(), vec!["second".to_string()]);
}
