//! Translates subscriber rates into hardware batch parameters

use std::sync::Arc;

use sensor_hal::{HalConnection, SensorIdentity, SensorType};

use crate::catalog::SensorCatalog;
use crate::client::ClientStore;
use crate::error::{BrokerError, Result};

/// Proximity reading reported once nobody holds the sensor
pub const PROXIMITY_FAR: f32 = 5.0;

/// Keeps the hardware rate of each sensor at the best subscriber rate
#[derive(Debug)]
pub struct RateManager {
    hal: Arc<HalConnection>,
    store: Arc<ClientStore>,
    catalog: Arc<SensorCatalog>,
}

impl RateManager {
    pub fn new(hal: Arc<HalConnection>, store: Arc<ClientStore>, catalog: Arc<SensorCatalog>) -> Self {
        Self { hal, store, catalog }
    }

    /// Record the client's rate, clamped to what the sensor supports
    ///
    /// The period is raised to the sensor's minimum and the delay is capped
    /// at what its FIFO can hold at the requested period.
    pub fn save_subscriber(&self, sensor: SensorIdentity, pid: i32, period_ns: i64, delay_ns: i64) -> bool {
        let (period_ns, delay_ns) = self.supported_rate(sensor, period_ns, delay_ns);
        if !self.store.update_subscription(sensor, pid, period_ns, delay_ns) {
            tracing::warn!(%sensor, pid, "Saving subscriber failed");
            return false;
        }
        tracing::debug!(%sensor, pid, period_ns, delay_ns, "Subscriber saved");
        true
    }

    fn supported_rate(&self, sensor: SensorIdentity, period_ns: i64, delay_ns: i64) -> (i64, i64) {
        let Some(descriptor) = self.catalog.get(&sensor) else {
            return (period_ns, delay_ns);
        };
        let period = period_ns.max(descriptor.min_sample_period_ns);
        let fifo = i64::from(descriptor.fifo_max_event_count.max(0));
        let delay = match period_ns.checked_mul(fifo) {
            Some(supported) if period_ns > 0 => delay_ns.min(supported),
            _ => delay_ns,
        };
        (period, delay)
    }

    /// Push the faster of the requested rate and the current best to hardware
    ///
    /// Nothing is sent when both requested values are slower than the best.
    pub fn set_best_params(&self, sensor: SensorIdentity, period_ns: i64, delay_ns: i64) -> Result<()> {
        if !sensor.sensor_type.is_valid() {
            return Err(BrokerError::InvalidArgument(format!("invalid sensor type {}", sensor.sensor_type)));
        }
        let best = self.store.best_activation(sensor);
        if period_ns > best.period_ns && delay_ns > best.delay_ns {
            tracing::debug!(%sensor, "Best parameters unchanged");
            return Ok(());
        }
        let period = period_ns.min(best.period_ns);
        let delay = delay_ns.min(best.delay_ns);
        self.hal.set_batch(&sensor, period, delay)?;
        tracing::info!(%sensor, period_ns = period, delay_ns = delay, "Applied best parameters");
        Ok(())
    }

    /// Re-apply the store's best pair after a subscriber left
    pub fn reset_best_params(&self, sensor: SensorIdentity) -> Result<()> {
        if !sensor.sensor_type.is_valid() {
            return Err(BrokerError::InvalidArgument(format!("invalid sensor type {}", sensor.sensor_type)));
        }
        let best = self.store.best_activation(sensor);
        if best.is_none() {
            return Ok(());
        }
        self.hal.set_batch(&sensor, best.period_ns, best.delay_ns)?;
        Ok(())
    }

    /// Whether someone besides `pid` still needs the sensor running
    ///
    /// When so, `pid`'s record is dropped and the remaining best rate applied.
    pub fn is_other_client_using(&self, sensor: SensorIdentity, pid: i32) -> bool {
        if self.store.only_this_pid_enabled(sensor, pid) {
            return false;
        }
        self.store.remove_subscription(sensor, pid);
        if let Err(e) = self.reset_best_params(sensor) {
            tracing::warn!(%sensor, "Resetting best parameters failed: {}", e);
        }
        tracing::debug!(%sensor, pid, "Sensor still in use by other clients");
        true
    }

    /// Forget every subscriber of a sensor the hardware just stopped
    pub fn after_disable(&self, sensor: SensorIdentity) {
        self.store.clear_sensor(sensor);
        if is_proximity(sensor.sensor_type) {
            let far = PROXIMITY_FAR.to_ne_bytes();
            let rewritten = self.store.modify_last_event(sensor, |frame| {
                let len = far.len().max(frame.payload_len as usize).min(frame.payload.len());
                frame.payload[..far.len()].copy_from_slice(&far);
                frame.payload_len = len as u32;
            });
            if rewritten {
                tracing::debug!(%sensor, "Stored proximity state reset to far");
            }
        }
    }

    pub fn store(&self) -> &ClientStore {
        &self.store
    }
}

fn is_proximity(sensor_type: SensorType) -> bool {
    sensor_type == SensorType::PROXIMITY || sensor_type == SensorType::PROXIMITY1
}
