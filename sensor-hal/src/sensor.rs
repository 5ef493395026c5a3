//! Sensor identity, descriptor and raw event types shared by every layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of descriptor name and vendor strings, in bytes
pub const SENSOR_NAME_MAX_LEN: usize = 47;

/// Maximum length of firmware and hardware version strings, in bytes
pub const VERSION_MAX_LEN: usize = 15;

/// Numeric sensor type id as reported by the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorType(pub i32);

impl SensorType {
    pub const NONE: SensorType = SensorType(0);
    pub const ACCELEROMETER: SensorType = SensorType(1);
    pub const GYROSCOPE: SensorType = SensorType(2);
    pub const AMBIENT_LIGHT: SensorType = SensorType(5);
    pub const MAGNETIC_FIELD: SensorType = SensorType(6);
    pub const BAROMETER: SensorType = SensorType(8);
    pub const HALL: SensorType = SensorType(10);
    pub const PROXIMITY: SensorType = SensorType(12);
    pub const COLOR: SensorType = SensorType(14);
    pub const SAR: SensorType = SensorType(15);
    pub const PROXIMITY1: SensorType = SensorType(16);
    pub const GRAVITY: SensorType = SensorType(257);
    pub const PEDOMETER_DETECTION: SensorType = SensorType(265);
    pub const PEDOMETER: SensorType = SensorType(266);
    pub const HEART_RATE: SensorType = SensorType(278);
    pub const HEADPOSTURE: SensorType = SensorType(284);

    /// Raw wire value
    pub fn as_raw(&self) -> i32 {
        self.0
    }

    /// Whether this is a valid (non-negative, non-none) type id
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a sensor lives on this device or on an attached one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locality {
    Local,
    Remote,
}

impl Locality {
    const LOCAL_RAW: i32 = 1;
    const REMOTE_RAW: i32 = 0;

    /// Raw wire value (1 for local, 0 for remote)
    pub fn as_raw(&self) -> i32 {
        match self {
            Locality::Local => Self::LOCAL_RAW,
            Locality::Remote => Self::REMOTE_RAW,
        }
    }

    /// Decode a raw wire value; anything other than the local marker is remote
    pub fn from_raw(raw: i32) -> Self {
        if raw == Self::LOCAL_RAW {
            Locality::Local
        } else {
            Locality::Remote
        }
    }
}

/// Composite key identifying one physical or virtual sensor instance
///
/// Equality and hashing use all four fields, so the same sensor type on two
/// attached devices is two different sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorIdentity {
    pub device_id: i32,
    pub sensor_type: SensorType,
    pub sensor_index: i32,
    pub locality: Locality,
}

impl SensorIdentity {
    pub fn new(device_id: i32, sensor_type: SensorType, sensor_index: i32, locality: Locality) -> Self {
        Self {
            device_id,
            sensor_type,
            sensor_index,
            locality,
        }
    }

    /// Identity of the first sensor of `sensor_type` on the local device
    pub fn local(device_id: i32, sensor_type: SensorType) -> Self {
        Self::new(device_id, sensor_type, 0, Locality::Local)
    }
}

impl fmt::Display for SensorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}#{}",
            self.device_id,
            self.sensor_type,
            self.sensor_index,
            self.locality.as_raw()
        )
    }
}

/// How a sensor reports data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportingMode {
    Default,
    Realtime,
    OnChange,
    OneShot,
    Fifo,
}

impl ReportingMode {
    pub fn as_raw(&self) -> i32 {
        match self {
            ReportingMode::Default => 0,
            ReportingMode::Realtime => 1,
            ReportingMode::OnChange => 2,
            ReportingMode::OneShot => 3,
            ReportingMode::Fifo => 4,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ReportingMode::Default),
            1 => Some(ReportingMode::Realtime),
            2 => Some(ReportingMode::OnChange),
            3 => Some(ReportingMode::OneShot),
            4 => Some(ReportingMode::Fifo),
            _ => None,
        }
    }

    /// On-change and one-shot sensors bypass rate coalescing
    pub fn is_event_driven(&self) -> bool {
        matches!(self, ReportingMode::OnChange | ReportingMode::OneShot)
    }
}

/// Static description of a sensor, as returned by enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub identity: SensorIdentity,
    pub name: String,
    pub vendor: String,
    pub firmware_version: String,
    pub hardware_version: String,
    pub max_range: f32,
    pub precision: f32,
    pub power: f32,
    pub min_sample_period_ns: i64,
    pub max_sample_period_ns: i64,
    /// Hardware FIFO depth; 0 when the sensor cannot batch
    pub fifo_max_event_count: i32,
}

impl SensorDescriptor {
    /// Create a descriptor with bounded name/vendor strings and zeroed limits
    pub fn new(identity: SensorIdentity, name: &str, vendor: &str) -> Self {
        Self {
            identity,
            name: bounded(name, SENSOR_NAME_MAX_LEN),
            vendor: bounded(vendor, SENSOR_NAME_MAX_LEN),
            firmware_version: String::new(),
            hardware_version: String::new(),
            max_range: 0.0,
            precision: 0.0,
            power: 0.0,
            min_sample_period_ns: 0,
            max_sample_period_ns: 0,
            fifo_max_event_count: 0,
        }
    }

    pub fn with_versions(mut self, firmware: &str, hardware: &str) -> Self {
        self.firmware_version = bounded(firmware, VERSION_MAX_LEN);
        self.hardware_version = bounded(hardware, VERSION_MAX_LEN);
        self
    }

    pub fn with_sample_period(mut self, min_ns: i64, max_ns: i64) -> Self {
        self.min_sample_period_ns = min_ns;
        self.max_sample_period_ns = max_ns;
        self
    }

    pub fn with_fifo_max_event_count(mut self, count: i32) -> Self {
        self.fifo_max_event_count = count;
        self
    }

    pub fn with_physics(mut self, max_range: f32, precision: f32, power: f32) -> Self {
        self.max_range = max_range;
        self.precision = precision;
        self.power = power;
        self
    }

    pub fn sensor_type(&self) -> SensorType {
        self.identity.sensor_type
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence
fn bounded(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// One raw reading as delivered by a backend, before wire normalization
#[derive(Debug, Clone, PartialEq)]
pub struct HalEvent {
    pub identity: SensorIdentity,
    pub version: i32,
    pub timestamp_ns: i64,
    pub option: u32,
    pub mode: i32,
    pub data: Vec<u8>,
}

impl HalEvent {
    pub fn new(identity: SensorIdentity, timestamp_ns: i64, data: Vec<u8>) -> Self {
        Self {
            identity,
            version: 0,
            timestamp_ns,
            option: 0,
            mode: ReportingMode::Realtime.as_raw(),
            data,
        }
    }

    pub fn with_mode(mut self, mode: ReportingMode) -> Self {
        self.mode = mode.as_raw();
        self
    }
}

/// Hot-plug transition reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlugStatus {
    Online,
    Offline,
}

/// A sensor appearing or disappearing at runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPlugInfo {
    pub identity: SensorIdentity,
    pub device_name: String,
    pub status: PlugStatus,
    pub reserved: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display_uses_all_fields() {
        let id = SensorIdentity::new(7, SensorType::GYROSCOPE, 2, Locality::Remote);
        assert_eq!(id.to_string(), "7#2#2#0");
    }

    #[test]
    fn test_identity_hash_distinguishes_devices() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(SensorIdentity::local(1, SensorType::ACCELEROMETER));
        set.insert(SensorIdentity::local(2, SensorType::ACCELEROMETER));
        set.insert(SensorIdentity::new(1, SensorType::ACCELEROMETER, 0, Locality::Remote));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_locality_raw() {
        assert_eq!(Locality::from_raw(1), Locality::Local);
        assert_eq!(Locality::from_raw(0), Locality::Remote);
        assert_eq!(Locality::from_raw(42), Locality::Remote);
        assert_eq!(Locality::Local.as_raw(), 1);
    }

    #[test]
    fn test_descriptor_strings_are_bounded() {
        let long = "x".repeat(100);
        let desc = SensorDescriptor::new(SensorIdentity::local(0, SensorType::SAR), &long, "acme")
            .with_versions(&long, "1.0");
        assert_eq!(desc.name.len(), SENSOR_NAME_MAX_LEN);
        assert_eq!(desc.firmware_version.len(), VERSION_MAX_LEN);
        assert_eq!(desc.hardware_version, "1.0");
    }

    #[test]
    fn test_bounded_respects_char_boundaries() {
        let s = "é".repeat(30);
        let out = bounded(&s, 15);
        assert!(out.len() <= 15);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_reporting_mode_raw() {
        for mode in [
            ReportingMode::Default,
            ReportingMode::Realtime,
            ReportingMode::OnChange,
            ReportingMode::OneShot,
            ReportingMode::Fifo,
        ] {
            assert_eq!(ReportingMode::from_raw(mode.as_raw()), Some(mode));
        }
        assert_eq!(ReportingMode::from_raw(9), None);
        assert!(ReportingMode::OnChange.is_event_driven());
        assert!(!ReportingMode::Realtime.is_event_driven());
    }
}
