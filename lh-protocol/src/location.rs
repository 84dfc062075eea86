//! Position, session option and geofence types carried in both directions.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Which location fields are populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationFlags(u32);

bitflags! {
    impl LocationFlags: u32 {
        const HAS_LAT_LONG = 1 << 0;
        const HAS_ALTITUDE = 1 << 1;
        const HAS_SPEED = 1 << 2;
        const HAS_BEARING = 1 << 3;
        const HAS_ACCURACY = 1 << 4;
        const HAS_VERTICAL_ACCURACY = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub flags: LocationFlags,
    /// UTC milliseconds; 0 means the engine had no time fix
    pub timestamp_ms: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed: f32,
    pub bearing: f32,
    /// Horizontal accuracy in meters
    pub accuracy: f32,
    pub vertical_accuracy: f32,
    /// Technologies that contributed to this fix
    pub tech_mask: u32,
}

impl Location {
    /// The all-zero location sent when nothing better is known.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.timestamp_ms == 0
    }

    pub fn has_position(&self) -> bool {
        self.flags.contains(LocationFlags::HAS_LAT_LONG)
    }

    /// A fix usable for accuracy-gated requests: timestamped, positioned and
    /// carrying a horizontal accuracy.
    pub fn is_qualified_fix(&self) -> bool {
        self.timestamp_ms != 0
            && self
                .flags
                .contains(LocationFlags::HAS_LAT_LONG | LocationFlags::HAS_ACCURACY)
    }
}

/// Extended report delivered to clients subscribed to detailed locations
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationInfo {
    pub location: Location,
    pub altitude_msl: f32,
    pub hdop: f32,
    pub num_sv_used: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEngine {
    Fused,
    Spe,
    Ppe,
    Dre,
    Vpe,
}

/// One engine's view of the current position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineLocation {
    pub engine: PositionEngine,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    #[default]
    Standalone,
    MsBased,
    MsAssisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingOptions {
    pub min_interval_ms: u32,
    #[serde(default)]
    pub min_distance_m: u32,
    #[serde(default)]
    pub mode: PositionMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchingMode {
    Routine,
    Trip,
    #[default]
    NoAutoReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingOptions {
    pub min_interval_ms: u32,
    #[serde(default)]
    pub min_distance_m: u32,
    pub mode: BatchingMode,
}

/// Geofence transitions a client wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreachMask(u32);

bitflags! {
    impl BreachMask: u32 {
        const ENTER = 1 << 0;
        const EXIT = 1 << 1;
        const DWELL_IN = 1 << 2;
        const DWELL_OUT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachType {
    Enter,
    Exit,
    DwellIn,
    DwellOut,
}

/// Notification policy of a geofence (the part that can be modified)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeofenceOptions {
    pub breach_mask: BreachMask,
    pub responsiveness_ms: u32,
    #[serde(default)]
    pub dwell_time_s: u32,
}

/// A geofence as submitted by a client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofenceSpec {
    /// Identifier chosen by the client, unique within that client
    pub id: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    #[serde(flatten)]
    pub options: GeofenceOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeofenceModification {
    pub id: u32,
    #[serde(flatten)]
    pub options: GeofenceOptions,
}

impl GeofenceSpec {
    pub fn validate(&self) -> Result<(), String> {
        validate_coordinates(self.latitude, self.longitude)?;
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            return Err(format!("Geofence {} radius must be positive", self.id));
        }
        if self.options.breach_mask.is_empty() {
            return Err(format!("Geofence {} has an empty breach mask", self.id));
        }
        Ok(())
    }
}

pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), String> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err("Latitude out of range (-90..90)".into());
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err("Longitude out of range (-180..180)".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(flags: LocationFlags, timestamp_ms: u64) -> Location {
        Location { flags, timestamp_ms, accuracy: 12.0, ..Location::default() }
    }

    #[test]
    fn test_qualified_fix_needs_time_position_and_accuracy() {
        let full = LocationFlags::HAS_LAT_LONG | LocationFlags::HAS_ACCURACY;
        assert!(fix(full, 1_700_000_000_000).is_qualified_fix());
        assert!(!fix(full, 0).is_qualified_fix());
        assert!(!fix(LocationFlags::HAS_LAT_LONG, 1).is_qualified_fix());
    }

    #[test]
    fn test_empty_location() {
        assert!(Location::empty().is_empty());
        assert!(!fix(LocationFlags::HAS_LAT_LONG, 5).is_empty());
    }

    #[test]
    fn test_geofence_validation() {
        let mut spec = GeofenceSpec {
            id: 7,
            latitude: 37.4,
            longitude: -122.1,
            radius_m: 100.0,
            options: GeofenceOptions {
                breach_mask: BreachMask::ENTER | BreachMask::EXIT,
                responsiveness_ms: 5000,
                dwell_time_s: 0,
            },
        };
        assert!(spec.validate().is_ok());

        spec.radius_m = 0.0;
        assert!(spec.validate().is_err());

        spec.radius_m = 10.0;
        spec.latitude = 91.0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_breach_mask_is_plain_integer_on_the_wire() {
        let json = serde_json::to_string(&(BreachMask::ENTER | BreachMask::DWELL_IN)).unwrap();
        assert_eq!(json, "5");
    }
}
