//! Engine configuration commands and the values the engine reports back.

use serde::{Deserialize, Serialize};

use crate::location::PositionEngine;
use crate::RequestKind;

/// Configuration parameter set/get requests. All of them except the
/// terrestrial consent flag are answered asynchronously by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ConfigCommand {
    ConstrainedTunc { enable: bool, threshold: f32, power_budget: u32 },
    PositionAssistedClockEstimator { enable: bool },
    /// Enable mask over constellations; `reset_to_default` ignores the mask
    Constellations { enabled_mask: u32, reset_to_default: bool },
    ConstellationSecondaryBand { disabled_mask: u32 },
    DeleteAidingData { delete_all: bool, engine_mask: u32 },
    LeverArm { forward_m: f32, sideways_m: f32, up_m: f32 },
    RobustLocation { enable: bool, enable_for_e911: bool },
    MinGpsWeek { week: u16 },
    MinSvElevation { degrees: u8 },
    EngineRunState { engine: PositionEngine, suspend: bool },
    UserConsentTerrestrial { consent: bool },
    OutputNmeaTypes { types_mask: u32 },
    EngineIntegrityRisk { engine: PositionEngine, risk: u32 },
    XtraParams { enable: bool, download_interval_minutes: u32 },
    GetRobustLocationConfig,
    GetMinGpsWeek,
    GetMinSvElevation,
    GetConstellationSecondaryBandConfig,
    GetXtraStatus,
    RegisterXtraStatusUpdates,
    DeregisterXtraStatusUpdates,
}

impl ConfigCommand {
    pub fn kind(&self) -> RequestKind {
        match self {
            ConfigCommand::ConstrainedTunc { .. } => RequestKind::ConfigConstrainedTunc,
            ConfigCommand::PositionAssistedClockEstimator { .. } => {
                RequestKind::ConfigPositionAssistedClockEstimator
            }
            ConfigCommand::Constellations { .. } => RequestKind::ConfigConstellations,
            ConfigCommand::ConstellationSecondaryBand { .. } => {
                RequestKind::ConfigConstellationSecondaryBand
            }
            ConfigCommand::DeleteAidingData { .. } => RequestKind::ConfigDeleteAidingData,
            ConfigCommand::LeverArm { .. } => RequestKind::ConfigLeverArm,
            ConfigCommand::RobustLocation { .. } => RequestKind::ConfigRobustLocation,
            ConfigCommand::MinGpsWeek { .. } => RequestKind::ConfigMinGpsWeek,
            ConfigCommand::MinSvElevation { .. } => RequestKind::ConfigMinSvElevation,
            ConfigCommand::EngineRunState { .. } => RequestKind::ConfigEngineRunState,
            ConfigCommand::UserConsentTerrestrial { .. } => {
                RequestKind::ConfigUserConsentTerrestrial
            }
            ConfigCommand::OutputNmeaTypes { .. } => RequestKind::ConfigOutputNmeaTypes,
            ConfigCommand::EngineIntegrityRisk { .. } => RequestKind::ConfigEngineIntegrityRisk,
            ConfigCommand::XtraParams { .. } => RequestKind::ConfigXtraParams,
            ConfigCommand::GetRobustLocationConfig => RequestKind::GetRobustLocationConfig,
            ConfigCommand::GetMinGpsWeek => RequestKind::GetMinGpsWeek,
            ConfigCommand::GetMinSvElevation => RequestKind::GetMinSvElevation,
            ConfigCommand::GetConstellationSecondaryBandConfig => {
                RequestKind::GetConstellationSecondaryBandConfig
            }
            ConfigCommand::GetXtraStatus => RequestKind::GetXtraStatus,
            ConfigCommand::RegisterXtraStatusUpdates => RequestKind::RegisterXtraStatusUpdates,
            ConfigCommand::DeregisterXtraStatusUpdates => {
                RequestKind::DeregisterXtraStatusUpdates
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ConfigCommand::ConstrainedTunc { threshold, .. } => {
                if !threshold.is_finite() || *threshold < 0.0 {
                    return Err("TUNC threshold must be a non-negative number".into());
                }
                Ok(())
            }
            ConfigCommand::LeverArm { forward_m, sideways_m, up_m } => {
                if [forward_m, sideways_m, up_m].iter().any(|v| !v.is_finite()) {
                    return Err("Lever arm offsets must be finite".into());
                }
                Ok(())
            }
            ConfigCommand::MinSvElevation { degrees } => {
                if *degrees > 90 {
                    return Err("Minimum SV elevation must be 0-90 degrees".into());
                }
                Ok(())
            }
            ConfigCommand::XtraParams { enable: true, download_interval_minutes } => {
                if *download_interval_minutes == 0 {
                    return Err("XTRA download interval must be nonzero".into());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobustLocationConfig {
    pub enabled: bool,
    pub enabled_for_e911: bool,
    pub major_version: u8,
    pub minor_version: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XtraDataStatus {
    #[default]
    Unknown,
    NotAvailable,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XtraStatus {
    pub feature_enabled: bool,
    pub data_status: XtraDataStatus,
    pub valid_for_hours: u32,
}

/// Configuration values reported by the engine for a getter request. Only
/// the fields the getter asked about are populated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robust_location: Option<RobustLocationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_gps_week: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_sv_elevation: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_band_disabled_mask: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xtra_status: Option<XtraStatus>,
}

impl EngineConfig {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
