//! Value types handed out by the store

use serde::{Deserialize, Serialize};
use sensor_hal::SensorIdentity;

/// One client's requested rate for one sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub period_ns: i64,
    pub delay_ns: i64,
    pub enabled: bool,
    /// Cleared when the client loses the permission guarding the sensor type
    pub perm_granted: bool,
}

impl SubscriptionRecord {
    pub fn new(period_ns: i64, delay_ns: i64) -> Self {
        Self {
            period_ns,
            delay_ns,
            enabled: true,
            perm_granted: true,
        }
    }

    /// Reports buffered per delivery, `delay / period`
    pub fn fifo_count(&self) -> u64 {
        if self.period_ns <= 0 {
            return 0;
        }
        (self.delay_ns / self.period_ns).max(0) as u64
    }
}

/// The rate actually requested from hardware for one sensor
///
/// Each field is the minimum over every enabled subscription. With no
/// enabled subscription both fields are `i64::MAX` ([`BestActivation::NONE`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestActivation {
    pub period_ns: i64,
    pub delay_ns: i64,
}

impl BestActivation {
    pub const NONE: Self = Self {
        period_ns: i64::MAX,
        delay_ns: i64::MAX,
    };

    pub fn new(period_ns: i64, delay_ns: i64) -> Self {
        Self { period_ns, delay_ns }
    }

    /// True when no client has the sensor enabled
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

/// Identity of a connected client process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppThreadInfo {
    pub pid: i32,
    pub uid: i32,
    pub access_token: u32,
}

/// Diagnostic view of one (sensor, client) subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub pid: i32,
    pub uid: Option<i32>,
    pub sensor: SensorIdentity,
    pub period_ns: i64,
    pub delay_ns: i64,
    pub fifo_count: u64,
    pub cmds: Vec<i32>,
}
