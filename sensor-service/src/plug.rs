//! Hot-plug notifications forwarded to interested clients

use chrono::{DateTime, Utc};
use sensor_hal::{PlugStatus, SensorIdentity, SensorPlugInfo};
use serde::{Deserialize, Serialize};

/// A sensor attached to or detached from the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPlugEvent {
    pub sensor: SensorIdentity,
    pub device_name: String,
    pub status: PlugStatus,
    pub timestamp: DateTime<Utc>,
}

impl SensorPlugEvent {
    pub fn from_info(info: &SensorPlugInfo) -> Self {
        Self {
            sensor: info.identity,
            device_name: info.device_name.clone(),
            status: info.status,
            timestamp: Utc::now(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PlugStatus::Online
    }
}

/// One client's subscription as reported to active-info listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInfo {
    pub pid: i32,
    pub sensor: SensorIdentity,
    pub period_ns: i64,
    pub delay_ns: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_hal::{Locality, SensorType};

    #[test]
    fn test_plug_event_from_info() {
        let info = SensorPlugInfo {
            identity: SensorIdentity::new(3, SensorType::ACCELEROMETER, 0, Locality::Remote),
            device_name: "band".to_string(),
            status: PlugStatus::Online,
            reserved: 0,
        };
        let before = Utc::now();
        let event = SensorPlugEvent::from_info(&info);
        assert!(event.is_online());
        assert_eq!(event.sensor, info.identity);
        assert!(event.timestamp >= before);
    }

    #[test]
    fn test_active_info_serializes() {
        let info = ActiveInfo {
            pid: 7,
            sensor: SensorIdentity::local(1, SensorType::SAR),
            period_ns: 100_000_000,
            delay_ns: 0,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"pid\":7"));
        let back: ActiveInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
