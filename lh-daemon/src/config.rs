//! Daemon configuration
//!
//! Loaded from an optional JSON file. Every field has a default so a missing
//! file or a partial file both yield a usable configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use lh_error::{LocHalError, Result};
use lh_protocol::PositionMode;

/// Liveness probe period
pub const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 60_000;

/// Tracking interval of the pooled single-shot session
pub const DEFAULT_POOLED_FIX_INTERVAL_MS: u32 = 1000;

const DEFAULT_MAX_CONNECTIONS: usize = 64;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Tracking session the daemon starts for itself at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoStartConfig {
    pub interval_ms: u32,
    /// Master position mode, forced onto every tracking request
    pub position_mode: PositionMode,
    pub delete_aiding_data_before_start: bool,
    pub aiding_data_engine_mask: u32,
}

impl Default for AutoStartConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            position_mode: PositionMode::Standalone,
            delete_aiding_data_before_start: false,
            aiding_data_engine_mask: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub maintenance_interval_ms: u64,
    pub max_connections: usize,
    pub read_timeout_secs: u64,
    pub auto_start: Option<AutoStartConfig>,
    /// Refuse terrestrial fixes until a client reports user consent
    pub require_terrestrial_consent: bool,
    pub pooled_fix_interval_ms: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            maintenance_interval_ms: DEFAULT_MAINTENANCE_INTERVAL_MS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            auto_start: None,
            require_terrestrial_consent: false,
            pooled_fix_interval_ms: DEFAULT_POOLED_FIX_INTERVAL_MS,
        }
    }
}

/// Get default socket path based on the runtime directory layout
pub fn default_socket_path() -> PathBuf {
    if Path::new("/run").exists() {
        PathBuf::from("/run/lochald.sock")
    } else {
        PathBuf::from("/var/run/lochald.sock")
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.maintenance_interval_ms == 0 {
            return Err(LocHalError::invalid_config(
                "maintenance_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.pooled_fix_interval_ms == 0 {
            return Err(LocHalError::invalid_config(
                "pooled_fix_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.max_connections == 0 {
            return Err(LocHalError::invalid_config("max_connections", "must be at least 1"));
        }
        if !self.socket_path.is_absolute() {
            return Err(LocHalError::invalid_path(
                self.socket_path.clone(),
                "socket path must be absolute",
            ));
        }
        if let Some(auto_start) = &self.auto_start {
            if auto_start.interval_ms == 0 {
                return Err(LocHalError::invalid_config(
                    "auto_start.interval_ms",
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Master position mode, when auto-start is configured
    pub fn master_position_mode(&self) -> Option<PositionMode> {
        self.auto_start.map(|a| a.position_mode)
    }
}

/// Load the configuration file, falling back to defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig> {
    let config = match path {
        None => DaemonConfig::default(),
        Some(path) => {
            let content = fs::read_to_string(path).map_err(|source| LocHalError::FileRead {
                path: path.to_path_buf(),
                source,
            })?;
            let config: DaemonConfig = serde_json::from_str(&content)?;
            debug!("Loaded configuration from {}", path.display());
            config
        }
    };
    config.validate()?;
    Ok(config)
}
