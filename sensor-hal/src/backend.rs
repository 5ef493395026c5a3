//! The swappable driver binding every backend implements.

use std::sync::Arc;

use crate::error::Result;
use crate::sensor::{HalEvent, SensorDescriptor, SensorIdentity, SensorPlugInfo};

/// Callback invoked on the backend's data thread for every raw reading
pub type DataCallback = Arc<dyn Fn(HalEvent) + Send + Sync>;

/// Callback invoked when a sensor is attached or detached at runtime
pub type PlugCallback = Arc<dyn Fn(SensorPlugInfo) + Send + Sync>;

/// Thin binding to a hardware driver
///
/// Implementations use interior mutability; every method takes `&self` so a
/// single backend can be shared between the broker's control path and the
/// hardware data thread. Calls may block for as long as the driver does.
pub trait HalBackend: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Acquire the underlying driver handle
    fn connect(&self) -> Result<()>;

    /// Enumerate every sensor the driver exposes
    fn list_sensors(&self) -> Result<Vec<SensorDescriptor>>;

    /// Enumerate the sensors of one attached device
    fn list_sensors_by_device(&self, device_id: i32) -> Result<Vec<SensorDescriptor>> {
        Ok(self
            .list_sensors()?
            .into_iter()
            .filter(|s| s.identity.device_id == device_id)
            .collect())
    }

    fn enable(&self, sensor: &SensorIdentity) -> Result<()>;

    fn disable(&self, sensor: &SensorIdentity) -> Result<()>;

    /// Set the sampling period and maximum report delay, both in nanoseconds
    fn set_batch(&self, sensor: &SensorIdentity, sampling_ns: i64, report_ns: i64) -> Result<()>;

    fn set_mode(&self, sensor: &SensorIdentity, mode: i32) -> Result<()>;

    fn set_option(&self, sensor: &SensorIdentity, option: i32) -> Result<()>;

    /// Register the single raw-event callback
    fn register_callback(&self, callback: DataCallback) -> Result<()>;

    /// Register the hot-plug callback
    fn register_plug_callback(&self, callback: PlugCallback) -> Result<()>;

    /// Drop the registered data callback
    fn unregister(&self) -> Result<()>;

    /// Release the driver handle
    fn destroy(&self) -> Result<()>;
}
