use thiserror::Error;

use crate::sensor::SensorIdentity;

/// Errors raised by hardware backends and the backend selector
///
/// Every variant is recoverable at the call site except `NoBackendAvailable`,
/// which the broker treats as a startup failure.
#[derive(Debug, Error)]
pub enum HalError {
    /// The backend could not acquire its driver handle
    #[error("Failed to connect to {backend}: {reason}")]
    ConnectFailed {
        /// Name of the backend that failed
        backend: &'static str,
        /// Human readable reason
        reason: String,
    },

    /// None of the probed backends connected
    #[error("No HAL backend available (tried {tried} candidates)")]
    NoBackendAvailable { tried: usize },

    /// The sensor is not enumerated by the active backend
    #[error("Unknown sensor: {0}")]
    UnknownSensor(SensorIdentity),

    /// The remote HAL speaks an interface version we do not support
    #[error("HAL interface version {found} is older than required {required}")]
    VersionMismatch { found: u32, required: u32 },

    /// A data callback is already registered with the backend
    #[error("A data callback is already registered")]
    AlreadyRegistered,

    /// The backend has not been connected yet, or was destroyed
    #[error("HAL backend is not connected")]
    NotConnected,

    /// The driver rejected an operation with a status code
    #[error("Driver call {op} failed with code {code}")]
    Driver { op: &'static str, code: i32 },
}

impl HalError {
    /// Shorthand for a driver status failure
    pub fn driver(op: &'static str, code: i32) -> Self {
        Self::Driver { op, code }
    }
}

/// Type alias for results that can return a HalError
pub type Result<T> = std::result::Result<T, HalError>;
