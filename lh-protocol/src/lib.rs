use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod location;

pub use config::{
    ConfigCommand, EngineConfig, RobustLocationConfig, XtraDataStatus, XtraStatus,
};
pub use location::{
    validate_coordinates, BatchingMode, BatchingOptions, BreachMask, BreachType, EngineLocation,
    GeofenceModification, GeofenceOptions, GeofenceSpec, Location, LocationFlags, LocationInfo,
    PositionEngine, PositionMode, TrackingOptions,
};

/// Maximum size of one inbound message line (16KB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Maximum number of geofences accepted in one add/modify call
pub const MAX_GEOFENCE_COUNT: usize = 20;

/// Maximum length of a client name
const MAX_CLIENT_NAME_LENGTH: usize = 64;

/// Name of the client the daemon creates for itself when auto-start is enabled
pub const AUTO_START_CLIENT_NAME: &str = "default";

/// Callbacks a client has subscribed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackMask(u32);

bitflags! {
    impl CallbackMask: u32 {
        /// Simple location reports
        const TRACKING = 1 << 0;
        /// Detailed location reports
        const LOCATION_INFO = 1 << 1;
        /// Per-engine location reports
        const ENGINE_LOCATIONS = 1 << 2;
        const SATELLITES = 1 << 3;
        const BATCHING = 1 << 4;
        const BATCHING_STATUS = 1 << 5;
        const GEOFENCE_BREACH = 1 << 6;

        const BATCHING_CALLBACKS = Self::BATCHING.bits() | Self::BATCHING_STATUS.bits();
    }
}

/// Features the daemon advertises to clients on registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityMask(u64);

bitflags! {
    impl CapabilityMask: u64 {
        const TIME_BASED_TRACKING = 1 << 0;
        const DISTANCE_BASED_TRACKING = 1 << 1;
        const TIME_BASED_BATCHING = 1 << 2;
        const DISTANCE_BASED_BATCHING = 1 << 3;
        const GEOFENCE = 1 << 4;
        const OUTDOOR_TRIP_BATCHING = 1 << 5;
        const CONSTELLATION_ENABLEMENT = 1 << 6;
        const TERRESTRIAL_POSITIONING = 1 << 7;
        const ENGINE_LOCATIONS = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    /// Application-facing positioning API
    #[default]
    LocationClientApi,
    /// Privileged integration API (configuration requests)
    LocationIntegrationApi,
}

/// The two single-shot fix services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixFlavor {
    /// Network-based fix, parameterized by a technology mask
    Terrestrial,
    /// SPE/GNSS-based fix, parameterized by a horizontal accuracy threshold
    Fused,
}

impl FixFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixFlavor::Terrestrial => "terrestrial",
            FixFlavor::Fused => "fused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Name of the client sending the request
    pub sender: String,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(sender: impl Into<String>, request: Request) -> Self {
        Self { sender: sender.into(), request }
    }

    /// Parse one inbound line and validate both the sender and the payload.
    pub fn decode(line: &str) -> Result<Self, String> {
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(format!(
                "Message too large: {} > {} bytes",
                line.len(),
                MAX_MESSAGE_SIZE
            ));
        }
        let envelope: RequestEnvelope =
            serde_json::from_str(line).map_err(|e| format!("Invalid request: {}", e))?;
        validate_client_name(&envelope.sender)?;
        envelope.request.validate()?;
        Ok(envelope)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Request {
    Register {
        #[serde(default)]
        client_kind: ClientKind,
    },
    Deregister,
    StartTracking { options: TrackingOptions },
    StopTracking {
        /// Keep the callback subscription for a later restart
        #[serde(default)]
        preserve_subscriptions: bool,
    },
    UpdateSubscription { callbacks: CallbackMask },
    UpdateTrackingOptions { options: TrackingOptions },
    StartBatching { options: BatchingOptions },
    StopBatching,
    UpdateBatchingOptions { options: BatchingOptions },
    AddGeofences { geofences: Vec<GeofenceSpec> },
    RemoveGeofences { ids: Vec<u32> },
    ModifyGeofences { geofences: Vec<GeofenceModification> },
    PauseGeofences { ids: Vec<u32> },
    ResumeGeofences { ids: Vec<u32> },
    GetSingleTerrestrialFix {
        timeout_ms: u32,
        tech_mask: u32,
        #[serde(default)]
        accuracy_m: f32,
    },
    GetSingleFusedFix { timeout_ms: u32, accuracy_m: f32 },
    Config(ConfigCommand),
    UpdateNetworkAvailability { available: bool },
    InjectLocation { location: Location },
    GetEnergyConsumed,
    GetAntennaInfo,
    GetDebugReport,
    PingTest,
}

/// Flat request discriminant echoed back in acknowledgments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Register,
    Deregister,
    StartTracking,
    StopTracking,
    UpdateSubscription,
    UpdateTrackingOptions,
    StartBatching,
    StopBatching,
    UpdateBatchingOptions,
    AddGeofences,
    RemoveGeofences,
    ModifyGeofences,
    PauseGeofences,
    ResumeGeofences,
    GetSingleTerrestrialFix,
    GetSingleFusedFix,
    ConfigConstrainedTunc,
    ConfigPositionAssistedClockEstimator,
    ConfigConstellations,
    ConfigConstellationSecondaryBand,
    ConfigDeleteAidingData,
    ConfigLeverArm,
    ConfigRobustLocation,
    ConfigMinGpsWeek,
    ConfigMinSvElevation,
    ConfigEngineRunState,
    ConfigUserConsentTerrestrial,
    ConfigOutputNmeaTypes,
    ConfigEngineIntegrityRisk,
    ConfigXtraParams,
    GetRobustLocationConfig,
    GetMinGpsWeek,
    GetMinSvElevation,
    GetConstellationSecondaryBandConfig,
    GetXtraStatus,
    RegisterXtraStatusUpdates,
    DeregisterXtraStatusUpdates,
    UpdateNetworkAvailability,
    InjectLocation,
    GetEnergyConsumed,
    GetAntennaInfo,
    GetDebugReport,
    PingTest,
}

impl Request {
    /// Validate request parameters. The geofence count limit is not checked
    /// here: an oversized batch is a well-formed request that gets rejected
    /// with a response.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Register { .. }
            | Request::Deregister
            | Request::StopTracking { .. }
            | Request::UpdateSubscription { .. }
            | Request::StopBatching
            | Request::UpdateNetworkAvailability { .. }
            | Request::GetEnergyConsumed
            | Request::GetAntennaInfo
            | Request::GetDebugReport
            | Request::PingTest => Ok(()),

            Request::StartTracking { .. } | Request::UpdateTrackingOptions { .. } => Ok(()),

            Request::StartBatching { options } | Request::UpdateBatchingOptions { options } => {
                validate_batching_options(options)
            }

            Request::AddGeofences { geofences } => {
                if geofences.is_empty() {
                    return Err("Geofence list cannot be empty".into());
                }
                for spec in geofences {
                    spec.validate()?;
                }
                validate_unique_ids(geofences.iter().map(|g| g.id))
            }

            Request::ModifyGeofences { geofences } => {
                if geofences.is_empty() {
                    return Err("Geofence list cannot be empty".into());
                }
                if geofences.iter().any(|g| g.options.breach_mask.is_empty()) {
                    return Err("Geofence breach mask cannot be empty".into());
                }
                validate_unique_ids(geofences.iter().map(|g| g.id))
            }

            Request::RemoveGeofences { ids }
            | Request::PauseGeofences { ids }
            | Request::ResumeGeofences { ids } => {
                if ids.is_empty() {
                    return Err("Geofence id list cannot be empty".into());
                }
                Ok(())
            }

            Request::GetSingleTerrestrialFix { accuracy_m, .. } => validate_accuracy(*accuracy_m),
            Request::GetSingleFusedFix { accuracy_m, .. } => validate_accuracy(*accuracy_m),

            Request::Config(command) => command.validate(),

            Request::InjectLocation { location } => {
                if location.has_position() {
                    validate_coordinates(location.latitude, location.longitude)?;
                }
                Ok(())
            }
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Register { .. } => RequestKind::Register,
            Request::Deregister => RequestKind::Deregister,
            Request::StartTracking { .. } => RequestKind::StartTracking,
            Request::StopTracking { .. } => RequestKind::StopTracking,
            Request::UpdateSubscription { .. } => RequestKind::UpdateSubscription,
            Request::UpdateTrackingOptions { .. } => RequestKind::UpdateTrackingOptions,
            Request::StartBatching { .. } => RequestKind::StartBatching,
            Request::StopBatching => RequestKind::StopBatching,
            Request::UpdateBatchingOptions { .. } => RequestKind::UpdateBatchingOptions,
            Request::AddGeofences { .. } => RequestKind::AddGeofences,
            Request::RemoveGeofences { .. } => RequestKind::RemoveGeofences,
            Request::ModifyGeofences { .. } => RequestKind::ModifyGeofences,
            Request::PauseGeofences { .. } => RequestKind::PauseGeofences,
            Request::ResumeGeofences { .. } => RequestKind::ResumeGeofences,
            Request::GetSingleTerrestrialFix { .. } => RequestKind::GetSingleTerrestrialFix,
            Request::GetSingleFusedFix { .. } => RequestKind::GetSingleFusedFix,
            Request::Config(command) => command.kind(),
            Request::UpdateNetworkAvailability { .. } => RequestKind::UpdateNetworkAvailability,
            Request::InjectLocation { .. } => RequestKind::InjectLocation,
            Request::GetEnergyConsumed => RequestKind::GetEnergyConsumed,
            Request::GetAntennaInfo => RequestKind::GetAntennaInfo,
            Request::GetDebugReport => RequestKind::GetDebugReport,
            Request::PingTest => RequestKind::PingTest,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Register { .. } => "Register",
            Request::Deregister => "Deregister",
            Request::StartTracking { .. } => "StartTracking",
            Request::StopTracking { .. } => "StopTracking",
            Request::UpdateSubscription { .. } => "UpdateSubscription",
            Request::UpdateTrackingOptions { .. } => "UpdateTrackingOptions",
            Request::StartBatching { .. } => "StartBatching",
            Request::StopBatching => "StopBatching",
            Request::UpdateBatchingOptions { .. } => "UpdateBatchingOptions",
            Request::AddGeofences { .. } => "AddGeofences",
            Request::RemoveGeofences { .. } => "RemoveGeofences",
            Request::ModifyGeofences { .. } => "ModifyGeofences",
            Request::PauseGeofences { .. } => "PauseGeofences",
            Request::ResumeGeofences { .. } => "ResumeGeofences",
            Request::GetSingleTerrestrialFix { .. } => "GetSingleTerrestrialFix",
            Request::GetSingleFusedFix { .. } => "GetSingleFusedFix",
            Request::Config(_) => "Config",
            Request::UpdateNetworkAvailability { .. } => "UpdateNetworkAvailability",
            Request::InjectLocation { .. } => "InjectLocation",
            Request::GetEnergyConsumed => "GetEnergyConsumed",
            Request::GetAntennaInfo => "GetAntennaInfo",
            Request::GetDebugReport => "GetDebugReport",
            Request::PingTest => "PingTest",
        }
    }
}

/// Status carried by every acknowledgment and single-fix report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationError {
    Success,
    GeneralFailure,
    CallbackMissing,
    InvalidParameter,
    IdExist,
    IdUnknown,
    AlreadyStarted,
    NotInitialized,
    GeofencesAtMax,
    NotSupported,
    Timeout,
}

impl LocationError {
    pub fn is_success(&self) -> bool {
        matches!(self, LocationError::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeofenceResult {
    pub id: u32,
    pub status: LocationError,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AntennaInfo {
    pub carrier_frequency_mhz: f64,
    pub phase_center_offset_x_mm: f64,
    pub phase_center_offset_y_mm: f64,
    pub phase_center_offset_z_mm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DebugReport {
    pub engine_enabled: bool,
    pub fixes_reported: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location: Option<Location>,
}

/// Messages the daemon sends to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Indication {
    Capabilities { capabilities: CapabilityMask },
    Response { request: RequestKind, status: LocationError },
    GeofenceResponse { request: RequestKind, results: Vec<GeofenceResult> },
    Location { location: Location },
    LocationInfo { info: LocationInfo },
    EngineLocations { locations: Vec<EngineLocation> },
    BatchedLocations { locations: Vec<Location>, complete: bool },
    GeofenceBreach {
        ids: Vec<u32>,
        location: Location,
        breach: BreachType,
        timestamp_ms: u64,
    },
    SingleFix { flavor: FixFlavor, status: LocationError, location: Location },
    Config { request: RequestKind, config: EngineConfig },
    XtraStatus { status: XtraStatus },
    EnergyConsumed { total_energy_uws: u64 },
    AntennaInfo { antennas: Vec<AntennaInfo> },
    DebugReport { report: DebugReport },
    /// Liveness probe
    Ping,
    /// Answer to a client's PingTest
    Pong,
}

impl Indication {
    pub fn response(request: RequestKind, status: LocationError) -> Self {
        Indication::Response { request, status }
    }

    pub fn success(request: RequestKind) -> Self {
        Self::response(request, LocationError::Success)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Indication::Capabilities { .. } => "Capabilities",
            Indication::Response { .. } => "Response",
            Indication::GeofenceResponse { .. } => "GeofenceResponse",
            Indication::Location { .. } => "Location",
            Indication::LocationInfo { .. } => "LocationInfo",
            Indication::EngineLocations { .. } => "EngineLocations",
            Indication::BatchedLocations { .. } => "BatchedLocations",
            Indication::GeofenceBreach { .. } => "GeofenceBreach",
            Indication::SingleFix { .. } => "SingleFix",
            Indication::Config { .. } => "Config",
            Indication::XtraStatus { .. } => "XtraStatus",
            Indication::EnergyConsumed { .. } => "EnergyConsumed",
            Indication::AntennaInfo { .. } => "AntennaInfo",
            Indication::DebugReport { .. } => "DebugReport",
            Indication::Ping => "Ping",
            Indication::Pong => "Pong",
        }
    }

    /// Serialize as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

pub fn validate_client_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Client name cannot be empty".into());
    }

    if name.len() > MAX_CLIENT_NAME_LENGTH {
        return Err(format!(
            "Client name too long: {} > {} chars",
            name.len(),
            MAX_CLIENT_NAME_LENGTH
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' && c != ':' {
            return Err(format!("Client name contains invalid character: {:?}", c));
        }
    }

    Ok(())
}

pub fn validate_accuracy(accuracy_m: f32) -> Result<(), String> {
    if !accuracy_m.is_finite() || accuracy_m < 0.0 {
        return Err("Accuracy must be a non-negative number of meters".into());
    }
    Ok(())
}

pub fn validate_batching_options(options: &BatchingOptions) -> Result<(), String> {
    if options.min_interval_ms == 0 && options.min_distance_m == 0 {
        return Err("Batching needs a nonzero interval or distance".into());
    }
    Ok(())
}

fn validate_unique_ids(ids: impl Iterator<Item = u32>) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(format!("Duplicate geofence id {}", id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence(id: u32) -> GeofenceSpec {
        GeofenceSpec {
            id,
            latitude: 48.85,
            longitude: 2.35,
            radius_m: 200.0,
            options: GeofenceOptions {
                breach_mask: BreachMask::ENTER,
                responsiveness_ms: 1000,
                dwell_time_s: 0,
            },
        }
    }

    #[test]
    fn test_decode_envelope() {
        let line = r#"{"sender":"app1","kind":"GetSingleFusedFix","payload":{"timeout_ms":5000,"accuracy_m":50.0}}"#;
        let env = RequestEnvelope::decode(line).unwrap();
        assert_eq!(env.sender, "app1");
        assert_eq!(
            env.request,
            Request::GetSingleFusedFix { timeout_ms: 5000, accuracy_m: 50.0 }
        );
        assert_eq!(env.request.kind(), RequestKind::GetSingleFusedFix);
    }

    #[test]
    fn test_decode_unit_and_config_requests() {
        let env = RequestEnvelope::decode(r#"{"sender":"app1","kind":"PingTest"}"#).unwrap();
        assert_eq!(env.request, Request::PingTest);

        let env = RequestEnvelope::decode(
            r#"{"sender":"lia","kind":"Config","payload":{"command":"get_xtra_status"}}"#,
        )
        .unwrap();
        assert_eq!(env.request.kind(), RequestKind::GetXtraStatus);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(RequestEnvelope::decode(r#"{"sender":"app1","kind":"FormatDisk"}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_payload_shape() {
        let line = r#"{"sender":"app1","kind":"StartTracking","payload":{"interval":"fast"}}"#;
        assert!(RequestEnvelope::decode(line).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_sender() {
        assert!(RequestEnvelope::decode(r#"{"sender":"","kind":"PingTest"}"#).is_err());
        assert!(RequestEnvelope::decode(r#"{"sender":"a b","kind":"PingTest"}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_line() {
        let line = format!(
            r#"{{"sender":"app1","kind":"PingTest","pad":"{}"}}"#,
            "x".repeat(MAX_MESSAGE_SIZE)
        );
        assert!(RequestEnvelope::decode(&line).unwrap_err().contains("too large"));
    }

    #[test]
    fn test_oversized_geofence_batch_is_well_formed() {
        let request = Request::AddGeofences { geofences: (0..25).map(fence).collect() };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_duplicate_geofence_ids_rejected() {
        let request = Request::AddGeofences { geofences: vec![fence(1), fence(1)] };
        assert!(request.validate().unwrap_err().contains("Duplicate"));
    }

    #[test]
    fn test_negative_accuracy_rejected() {
        let request = Request::GetSingleFusedFix { timeout_ms: 1000, accuracy_m: -1.0 };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_indication_line_format() {
        let line = Indication::success(RequestKind::StartTracking).to_line().unwrap();
        assert_eq!(
            line,
            "{\"kind\":\"Response\",\"payload\":{\"request\":\"start_tracking\",\"status\":\"success\"}}\n"
        );
        assert_eq!(Indication::Ping.to_line().unwrap(), "{\"kind\":\"Ping\"}\n");
    }

    #[test]
    fn test_batching_callbacks_group() {
        let mask = CallbackMask::TRACKING | CallbackMask::BATCHING | CallbackMask::BATCHING_STATUS;
        assert_eq!(mask - CallbackMask::BATCHING_CALLBACKS, CallbackMask::TRACKING);
    }
}
