//! # sensor-service
//!
//! Device-local sensor broker. One [`Broker`] multiplexes a single HAL
//! binding across many client processes: it keeps one hardware activation
//! per sensor at the fastest rate any client asked for, batches raw events
//! off the HAL thread, and writes them to each client's data channel at the
//! rate that client requested.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sensor_hal::{CompatibleBackend, HalBackend, SensorIdentity, SensorType};
//! use sensor_service::{Broker, BrokerConfig, ClientRegistration, ServiceClient};
//!
//! let backend: Arc<dyn HalBackend> = Arc::new(CompatibleBackend::with_default_sensors(1));
//! let broker = Broker::start(BrokerConfig::default(), vec![backend])?;
//! let session = broker.session(ClientRegistration::new(1200, 1000, 7));
//!
//! let sar = SensorIdentity::local(1, SensorType::SAR);
//! session.enable_sensor(sar, 100_000_000, 0)?;
//! session.disable_sensor(sar)?;
//! broker.shutdown();
//! # Ok::<(), sensor_service::BrokerError>(())
//! ```

pub mod batch;
pub mod broker;
pub mod catalog;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod logging;
pub mod manager;
pub mod plug;
pub mod power;
pub mod session;
pub mod worker;

pub use batch::EventBatchBuffer;
pub use broker::{Broker, BrokerDump, RecentEvents};
pub use catalog::SensorCatalog;
pub use client::{ClientChannel, ClientRegistration, ClientStore};
pub use config::BrokerConfig;
pub use dispatch::{DispatchStats, Dispatcher};
pub use error::{BrokerError, Result};
pub use gate::{AllowAll, PermissionGate};
pub use logging::{init_logging, init_logging_from_env, LoggingError, LoggingMode};
pub use plug::{ActiveInfo, SensorPlugEvent};
pub use power::SuspendedRate;
pub use session::{BrokerSession, ServiceClient};

/// Common imports for broker users
pub mod prelude {
    pub use crate::{
        ActiveInfo, Broker, BrokerConfig, BrokerError, BrokerSession, ClientRegistration, ServiceClient,
        SensorPlugEvent,
    };
    pub use sensor_hal::{SensorDescriptor, SensorIdentity, SensorType};
}
