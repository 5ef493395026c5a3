//! Subscription state for the sensor broker
//!
//! The store records, per sensor and per client process, the sampling
//! period and report delay each client asked for, and derives from them the
//! single rate actually requested from hardware: the minimum over all enabled
//! subscribers ([`BestActivation`]).
//!
//! It also tracks which data channel belongs to which process, permission
//! grants, command history, recent events, and listener registrations.
//! The store is pure state: it never calls into hardware or channels, and
//! malformed input yields `false`, `None` or an empty collection rather
//! than an error.
//!
//! ```rust
//! use std::sync::Arc;
//! use sensor_hal::{SensorIdentity, SensorType};
//! use sensor_store::{BestActivation, SubscriptionStore};
//!
//! let store: SubscriptionStore<String> = SubscriptionStore::default();
//! let accel = SensorIdentity::local(0, SensorType::ACCELEROMETER);
//!
//! store.bind_channel(100, Arc::new("channel-100".to_string()));
//! assert!(store.update_subscription(accel, 100, 100_000_000, 0));
//! assert!(store.update_subscription(accel, 200, 20_000_000, 0));
//! assert_eq!(store.best_activation(accel), BestActivation::new(20_000_000, 0));
//!
//! store.remove_subscription(accel, 200);
//! store.destroy_channel(100);
//! assert!(store.best_activation(accel).is_none());
//! ```

pub mod permission;
pub mod record;
pub mod store;

pub use record::{AppThreadInfo, BestActivation, ChannelInfo, SubscriptionRecord};
pub use store::{StoreLimits, SubscriptionStore};
