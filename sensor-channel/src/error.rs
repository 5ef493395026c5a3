use thiserror::Error;

/// Errors raised by frames, data channels and the readiness loop
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Socket level failure
    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A decoded frame claimed more payload than a frame can carry
    #[error("Corrupt frame: payload length {payload_len} exceeds {max}")]
    CorruptFrame { payload_len: u32, max: usize },

    /// A frame was built from a payload that does not fit
    #[error("Payload of {len} bytes does not fit in a frame")]
    PayloadTooLong { len: usize },

    /// The channel was destroyed before the call
    #[error("Channel has been destroyed")]
    Destroyed,

    /// The send endpoint was already handed to the broker
    #[error("Send endpoint has already been transferred")]
    EndpointTaken,

    /// The readiness loop is no longer running
    #[error("Readiness loop has stopped")]
    LoopStopped,

    /// The readiness loop runtime could not be started
    #[error("Failed to start readiness loop: {0}")]
    Runtime(String),
}

/// Type alias for results that can return a ChannelError
pub type Result<T> = std::result::Result<T, ChannelError>;
