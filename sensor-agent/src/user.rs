//! Callback identities subscribing through the proxy

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sensor_channel::EventFrame;

static NEXT_USER_ID: AtomicU64 = AtomicU64::new(1);

/// Invoked once per frame of a subscribed sensor, on the readiness loop thread
pub type SensorCallback = Arc<dyn Fn(&EventFrame) + Send + Sync>;

/// Identity of one [`SensorUser`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(u64);

impl UserId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user-{}", self.0)
    }
}

/// A callback together with the identity the proxy tracks it by
///
/// Clones share the identity, so a clone can be used to deactivate what the
/// original activated.
#[derive(Clone)]
pub struct SensorUser {
    id: UserId,
    callback: SensorCallback,
}

impl SensorUser {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        Self {
            id: UserId(NEXT_USER_ID.fetch_add(1, Ordering::Relaxed)),
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub(crate) fn callback(&self) -> SensorCallback {
        Arc::clone(&self.callback)
    }
}

impl fmt::Debug for SensorUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorUser").field("id", &self.id).finish()
    }
}
