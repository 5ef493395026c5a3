//! Error types for the sensor broker.

use sensor_channel::ChannelError;
use sensor_hal::{HalError, SensorIdentity, SensorType};

/// Errors returned by broker operations.
///
/// Every variant is a status for the caller; none of them leave residual
/// state behind.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// A rate, sensor or pid argument was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The client holds no subscription for the sensor
    #[error("Pid {pid} is not subscribed to {sensor}")]
    NotSubscribed {
        /// Client process id
        pid: i32,
        /// Sensor that was addressed
        sensor: SensorIdentity,
    },

    /// The client is already subscribed; callers treat this as success
    #[error("Pid {pid} is already subscribed to {sensor}")]
    AlreadySubscribed {
        /// Client process id
        pid: i32,
        /// Sensor that was addressed
        sensor: SensorIdentity,
    },

    /// The HAL rejected or could not perform the call
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[from] HalError),

    /// A data channel could not be created, used or destroyed
    #[error("Channel error: {0}")]
    ChannelError(#[from] ChannelError),

    /// A subscription ceiling or buffer pool limit was hit
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The permission gate denied access to the sensor type
    #[error("Permission denied for sensor type {sensor_type}")]
    PermissionDenied {
        /// Sensor type that was requested
        sensor_type: SensorType,
    },

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The pid is negative or unknown
    #[error("Invalid pid: {0}")]
    InvalidPid(i32),

    /// No sensor of the pid could be suspended
    #[error("Suspend failed for pid {0}")]
    SuspendFailed(i32),

    /// The pid is not suspended or one of its sensors could not be restored
    #[error("Resume failed for pid {0}")]
    ResumeFailed(i32),

    /// At least one suspended pid could not be resumed
    #[error("Reset failed for {0} pids")]
    ResetFailed(usize),

    /// Diagnostics could not be rendered
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for Results using BrokerError.
pub type Result<T> = std::result::Result<T, BrokerError>;
