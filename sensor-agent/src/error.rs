use sensor_hal::SensorIdentity;
use thiserror::Error;

use crate::user::UserId;

/// Errors returned by the client-side subscription proxy
#[derive(Error, Debug)]
pub enum AgentError {
    /// A rate or call-order argument was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The broker does not enumerate the sensor
    #[error("Unknown sensor {0}")]
    UnknownSensor(SensorIdentity),

    /// The user has no live subscription to the sensor
    #[error("{user} is not subscribed to {sensor}")]
    NotSubscribed { sensor: SensorIdentity, user: UserId },

    /// Unsubscribe was called before deactivate
    #[error("{user} must deactivate {sensor} before unsubscribing")]
    NotDeactivated { sensor: SensorIdentity, user: UserId },

    /// The data channel could not be created or handed over
    #[error("Data channel error: {0}")]
    Channel(#[from] sensor_channel::ChannelError),

    /// The broker rejected a control call
    #[error("Broker error: {0}")]
    Broker(#[from] sensor_service::BrokerError),
}

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, AgentError>;
