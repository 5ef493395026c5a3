//! Data channels between the sensor broker and its subscribers
//!
//! # Overview
//!
//! Sensor readings travel from the broker to each subscriber process over a
//! connected socket pair, one fixed-size [`EventFrame`] at a time. This crate
//! provides the pieces both sides share:
//!
//! - [`EventFrame`]: the 104 byte wire record and its codec
//! - [`FrameAssembler`]: rebuilds frames from arbitrary stream reads
//! - [`ReadinessLoop`]: one background thread that watches many sockets
//! - [`Transport`]: the subscriber's end of a channel
//! - [`FrameSender`]: the broker's end, with bounded retry and backlog
//!
//! # Architecture
//!
//! ```text
//! broker                                subscriber
//! FrameSender ──── socket pair ───────> Transport (receive end)
//!     │                                     │
//!     └── watch handle on broker loop       └── listener on subscriber loop
//! ```
//!
//! Either side closing its end is observed by the other as end of stream,
//! which triggers the same teardown as an explicit destroy.

pub mod assembler;
pub mod error;
pub mod frame;
pub mod readiness;
pub mod transport;

pub use assembler::FrameAssembler;
pub use error::{ChannelError, Result};
pub use frame::{EventFrame, FRAME_SIZE, MAX_PAYLOAD_LEN};
pub use readiness::{CloseCallback, CloseReason, FrameCallback, ListenerId, ReadinessLoop};
pub use transport::{FrameSender, SendEndpoint, SendPolicy, SendStatus, Transport};
