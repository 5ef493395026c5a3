//! Permission check consulted before a client may enable a sensor

use sensor_hal::SensorType;

/// Decides whether the holder of an access token may read a sensor type
pub trait PermissionGate: Send + Sync {
    fn check(&self, access_token: u32, sensor_type: SensorType) -> bool;
}

/// Grants everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn check(&self, _access_token: u32, _sensor_type: SensorType) -> bool {
        true
    }
}

impl<F> PermissionGate for F
where
    F: Fn(u32, SensorType) -> bool + Send + Sync,
{
    fn check(&self, access_token: u32, sensor_type: SensorType) -> bool {
        self(access_token, sensor_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closures_act_as_gates() {
        let deny_heart_rate = |_token: u32, sensor_type: SensorType| sensor_type != SensorType::HEART_RATE;
        assert!(deny_heart_rate.check(1, SensorType::ACCELEROMETER));
        assert!(!deny_heart_rate.check(1, SensorType::HEART_RATE));
        assert!(AllowAll.check(0, SensorType::HEART_RATE));
    }
}
