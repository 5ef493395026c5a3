//! Permission names and the sensor types they guard

use sensor_hal::SensorType;

pub const ACTIVITY_MOTION: &str = "ohos.permission.ACTIVITY_MOTION";
pub const READ_HEALTH_DATA: &str = "ohos.permission.READ_HEALTH_DATA";

const PERMISSION_GROUPS: &[(&str, &[SensorType])] = &[
    (
        ACTIVITY_MOTION,
        &[SensorType::PEDOMETER_DETECTION, SensorType::PEDOMETER],
    ),
    (READ_HEALTH_DATA, &[SensorType::HEART_RATE]),
];

/// Sensor types guarded by `permission`; empty for unknown names
pub fn sensor_types_for(permission: &str) -> &'static [SensorType] {
    PERMISSION_GROUPS
        .iter()
        .find(|(name, _)| *name == permission)
        .map(|(_, types)| *types)
        .unwrap_or(&[])
}

/// The permission guarding `sensor_type`, if any
pub fn permission_for(sensor_type: SensorType) -> Option<&'static str> {
    PERMISSION_GROUPS
        .iter()
        .find(|(_, types)| types.contains(&sensor_type))
        .map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups() {
        assert_eq!(sensor_types_for(ACTIVITY_MOTION).len(), 2);
        assert_eq!(sensor_types_for(READ_HEALTH_DATA), &[SensorType::HEART_RATE]);
        assert!(sensor_types_for("ohos.permission.CAMERA").is_empty());
        assert_eq!(permission_for(SensorType::PEDOMETER), Some(ACTIVITY_MOTION));
        assert_eq!(permission_for(SensorType::ACCELEROMETER), None);
    }
}
