//! # Sensor Agent
//!
//! Client-side half of the sensor broker. A [`SubscriptionProxy`] sits in the
//! client process, owns that process's single data channel, and turns the
//! broker's per-process subscriptions into per-callback ones.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sensor_agent::{SensorUser, SubscriptionProxy};
//! use sensor_hal::{CompatibleBackend, HalBackend, SensorIdentity, SensorType};
//! use sensor_service::{Broker, BrokerConfig, ClientRegistration};
//!
//! let backend: Arc<dyn HalBackend> = Arc::new(CompatibleBackend::with_default_sensors(1));
//! let broker = Broker::start(BrokerConfig::default(), vec![backend])?;
//! let proxy = SubscriptionProxy::new(Arc::new(broker.session(ClientRegistration::new(3000, 1000, 9))))?;
//!
//! let sar = SensorIdentity::local(1, SensorType::SAR);
//! let user = SensorUser::new(|frame| println!("{} at {}", frame.identity(), frame.timestamp));
//!
//! proxy.subscribe(sar, &user)?;
//! proxy.configure(sar, user.id(), 100_000_000, 0)?;
//! proxy.activate(sar, user.id())?;
//! // ...
//! proxy.deactivate(sar, user.id())?;
//! proxy.unsubscribe(sar, user.id())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Guarantees
//!
//! - Hardware sees at most one enable per sensor for any number of users
//!   activating it, and one disable when the last of them deactivates.
//! - The data channel exists exactly while some user holds a live
//!   subscription.
//! - Callbacks run on the readiness loop thread and never under the proxy's
//!   state lock, so a callback may call back into the proxy.

pub mod error;
pub mod proxy;
pub mod user;

pub use error::{AgentError, Result};
pub use proxy::{Rate, SubscriptionProxy, SubscriptionState};
pub use user::{SensorCallback, SensorUser, UserId};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{AgentError, Rate, Result, SensorUser, SubscriptionProxy, SubscriptionState, UserId};
    pub use sensor_hal::{SensorIdentity, SensorType};
}
