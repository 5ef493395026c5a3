//! Hardware abstraction for the sensor broker
//!
//! This crate defines the sensor identity and descriptor types every other
//! layer shares, the [`HalBackend`] trait a driver binding implements, two
//! interchangeable backends, and the [`HalConnection`] that selects one of
//! them at startup.
//!
//! ```rust
//! use std::sync::Arc;
//! use sensor_hal::{CompatibleBackend, HalBackend, HalConnection};
//!
//! let fallback: Arc<dyn HalBackend> = Arc::new(CompatibleBackend::with_default_sensors(1));
//! let hal = HalConnection::probe(vec![fallback])?;
//! assert_eq!(hal.backend_name(), "compatible");
//! assert_eq!(hal.list_sensors()?.len(), 4);
//! # Ok::<(), sensor_hal::HalError>(())
//! ```

pub mod backend;
pub mod compatible;
pub mod connection;
pub mod error;
pub mod remote;
pub mod sensor;

pub use backend::{DataCallback, HalBackend, PlugCallback};
pub use compatible::{default_sensors, CallLog, CompatibleBackend};
pub use connection::HalConnection;
pub use error::{HalError, Result};
pub use remote::{normalize_event, RemoteBackend, RemoteConfig, RemoteEvent, RemoteHal};
pub use sensor::{
    HalEvent, Locality, PlugStatus, ReportingMode, SensorDescriptor, SensorIdentity,
    SensorPlugInfo, SensorType,
};
