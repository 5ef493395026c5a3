//! The broker's view of enumerated sensors
//!
//! Seeded from the HAL at startup and kept current by hot-plug events.

use std::collections::HashMap;

use parking_lot::RwLock;
use sensor_hal::{SensorDescriptor, SensorIdentity};

/// Enumerated sensors keyed by identity
#[derive(Debug, Default)]
pub struct SensorCatalog {
    sensors: RwLock<HashMap<SensorIdentity, SensorDescriptor>>,
    max_sensors: usize,
}

impl SensorCatalog {
    pub fn new(max_sensors: usize) -> Self {
        Self {
            sensors: RwLock::new(HashMap::new()),
            max_sensors,
        }
    }

    /// Replace the catalog contents, keeping at most `max_sensors` entries
    pub fn load(&self, descriptors: Vec<SensorDescriptor>) -> usize {
        let mut sensors = self.sensors.write();
        sensors.clear();
        for descriptor in descriptors.into_iter().take(self.max_sensors) {
            sensors.insert(descriptor.identity, descriptor);
        }
        sensors.len()
    }

    /// Add sensors reported by a newly attached device; returns how many were new
    pub fn insert_all(&self, descriptors: Vec<SensorDescriptor>) -> usize {
        let mut sensors = self.sensors.write();
        let mut added = 0;
        for descriptor in descriptors {
            if sensors.len() >= self.max_sensors && !sensors.contains_key(&descriptor.identity) {
                tracing::warn!(sensor = %descriptor.identity, "Sensor catalog full, ignoring sensor");
                continue;
            }
            if sensors.insert(descriptor.identity, descriptor).is_none() {
                added += 1;
            }
        }
        added
    }

    pub fn remove(&self, sensor: &SensorIdentity) -> Option<SensorDescriptor> {
        self.sensors.write().remove(sensor)
    }

    pub fn contains(&self, sensor: &SensorIdentity) -> bool {
        self.sensors.read().contains_key(sensor)
    }

    pub fn get(&self, sensor: &SensorIdentity) -> Option<SensorDescriptor> {
        self.sensors.read().get(sensor).cloned()
    }

    /// Every descriptor, ordered by device, type and index
    pub fn list(&self) -> Vec<SensorDescriptor> {
        let mut list: Vec<SensorDescriptor> = self.sensors.read().values().cloned().collect();
        list.sort_by_key(|d| {
            (
                d.identity.device_id,
                d.identity.sensor_type.as_raw(),
                d.identity.sensor_index,
                d.identity.locality.as_raw(),
            )
        });
        list
    }

    pub fn len(&self) -> usize {
        self.sensors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.read().is_empty()
    }
}
