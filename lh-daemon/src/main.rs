//! Location HAL Daemon (lochald)
//!
//! Hosts the positioning engine and multiplexes it between any number of
//! local clients over a Unix domain socket.
//!
//! # Hardening Measures
//! - Resource limits (RLIMIT_NOFILE, RLIMIT_CORE)
//! - No core dumps in production
//! - Working directory set to /
//! - Symlink attack prevention on socket creation
//! - Maximum message size and connection limits
//! - Peer credential logging (UID/GID/PID) for every connection

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lh_daemon::engine::EngineEventSink;
use lh_daemon::{maintenance, server, Broker, LoopbackEngine};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "lochald")]
#[command(version)]
#[command(about = "Location HAL daemon - multi-client positioning session broker")]
struct Cli {
    /// Socket path (overrides the configuration file)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error); defaults to LOCHALD_LOG or info
    #[arg(long)]
    log_level: Option<String>,

    /// Run in foreground (always on; accepted for service-file compatibility)
    #[arg(short, long)]
    foreground: bool,
}

// ============================================================================
// Security Hardening
// ============================================================================

/// Set restrictive resource limits
fn set_resource_limits() {
    // Disable core dumps (security: prevent location history leakage)
    set_rlimit(libc::RLIMIT_CORE as i32, 0, 0);

    // Limit open file descriptors: socket + connections + logging
    set_rlimit(libc::RLIMIT_NOFILE as i32, 1024, 1024);

    debug!("Resource limits applied");
}

fn set_rlimit(resource: i32, soft: u64, hard: u64) {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: resource is a known RLIMIT_* constant and limit is fully initialized.
    unsafe {
        #[allow(clippy::useless_conversion)]
        if libc::setrlimit(resource as libc::__rlimit_resource_t, &limit) != 0 {
            warn!("Failed to set rlimit for resource {}", resource);
        }
    }
}

/// Change to root directory (prevent directory-based attacks)
fn secure_working_directory() {
    if std::env::set_current_dir("/").is_err() {
        warn!("Could not chdir to /");
    }
    debug!("Working directory set to /");
}

/// Validate socket path for security
fn validate_socket_path(path: &Path) -> Result<()> {
    let text = path.to_string_lossy();

    if !path.is_absolute() {
        bail!("Socket path must be absolute");
    }
    if text.contains("..") {
        bail!("Socket path contains path traversal");
    }
    if text.contains('\0') {
        bail!("Socket path contains null byte");
    }

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            bail!("Parent directory does not exist: {:?}", parent);
        }
    }

    // Symlink attack prevention
    if path.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
        bail!("Socket path is a symlink - refusing for security");
    }

    Ok(())
}

// ============================================================================
// Logging
// ============================================================================

/// Journald when the systemd journal is reachable, stdout otherwise.
/// Returns whether journald is in use.
fn init_logging(log_level: &str) -> bool {
    use tracing_subscriber::prelude::*;

    if Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(log_level))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(log_level)
        .init();
    false
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        // Log to stderr (captured by journald when running as a service)
        eprintln!("PANIC at {}: {}", location, message);
    }));

    let cli = Cli::parse();

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LOCHALD_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    let use_journald = init_logging(&log_level);

    // Read the config before leaving the caller's working directory so that
    // relative --config paths resolve.
    let mut config = lh_daemon::load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    config.validate().context("Invalid configuration")?;

    set_resource_limits();
    secure_working_directory();

    info!("STARTUP: lochald {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stdout" });
    info!("STARTUP: Socket path: {}", config.socket_path.display());
    info!("STARTUP: PID: {}", std::process::id());
    info!("STARTUP: Log level: {}", log_level);
    debug!("Foreground flag: {}", cli.foreground);

    validate_socket_path(&config.socket_path).context("Invalid socket path")?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = LoopbackEngine::new(EngineEventSink::new(events_tx.clone()));
    let mut broker = Broker::new(Box::new(engine), &config, events_tx);
    if let Some(auto_start) = &config.auto_start {
        broker.start_default_client(auto_start);
    }
    let broker = broker.into_shared();

    let pump = tokio::spawn(lh_daemon::run_event_pump(broker.clone(), events_rx));
    let probes = maintenance::spawn_maintenance(broker.clone(), config.maintenance_interval());
    info!(
        "Maintenance probing every {:?}",
        config.maintenance_interval()
    );

    let result = server::run_server(&config, broker.clone(), shutdown_signal()).await;

    probes.abort();
    broker.lock().await.shutdown();
    pump.abort();

    if config.socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&config.socket_path) {
            warn!("Failed to remove socket: {}", e);
        }
    }
    info!("SHUTDOWN: lochald terminated");

    result.context("Server error")
}
