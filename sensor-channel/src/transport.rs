//! Socket-pair data channels
//!
//! A [`Transport`] is the subscriber's end of a data channel. Creating one
//! makes a connected socket pair, registers the receive end with a
//! [`ReadinessLoop`], and keeps the send end until it is handed to the broker
//! with [`Transport::take_send_endpoint`].
//!
//! The broker wraps the endpoint in a [`FrameSender`]. Writes are
//! non-blocking: short writes and `WouldBlock` are retried a bounded number
//! of times, and anything still unwritten waits in a bounded backlog that is
//! flushed before the next write. When the backlog overflows, the oldest
//! frames that have not started transmitting are dropped and counted, so a
//! partially written frame is always completed and the stream never loses
//! alignment.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{ChannelError, Result};
use crate::frame::EventFrame;
use crate::readiness::{CloseCallback, CloseReason, FrameCallback, ListenerId, ReadinessLoop};

/// Subscriber side of a data channel
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    readiness: ReadinessLoop,
    listener: Mutex<Option<ListenerId>>,
    send_end: Mutex<Option<UnixStream>>,
    destroyed: AtomicBool,
}

impl TransportInner {
    fn teardown(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(id) = self.listener.lock().take() {
            self.readiness.deregister(id);
        }
        self.send_end.lock().take();
        true
    }
}

impl Transport {
    /// Create a channel whose frames are delivered to `on_frame`
    pub fn create(readiness: &ReadinessLoop, on_frame: FrameCallback) -> Result<Self> {
        Self::create_with_close(readiness, on_frame, Arc::new(|_| {}))
    }

    /// Like [`Transport::create`], also reporting when the broker side goes away
    ///
    /// The transport is already torn down when `on_close` runs.
    pub fn create_with_close(
        readiness: &ReadinessLoop,
        on_frame: FrameCallback,
        on_close: CloseCallback,
    ) -> Result<Self> {
        let (receive_end, send_end) = UnixStream::pair()?;
        send_end.set_nonblocking(true)?;

        let inner = Arc::new(TransportInner {
            readiness: readiness.clone(),
            listener: Mutex::new(None),
            send_end: Mutex::new(Some(send_end)),
            destroyed: AtomicBool::new(false),
        });

        let weak: Weak<TransportInner> = Arc::downgrade(&inner);
        let close: CloseCallback = Arc::new(move |reason: CloseReason| {
            if let Some(inner) = weak.upgrade() {
                inner.teardown();
            }
            on_close(reason);
        });
        let id = readiness.register(receive_end, on_frame, close)?;
        *inner.listener.lock() = Some(id);
        tracing::debug!("Data channel created on {}", id);
        Ok(Self { inner })
    }

    /// Hand the send end over to the broker; only succeeds once
    pub fn take_send_endpoint(&self) -> Result<SendEndpoint> {
        if !self.is_active() {
            return Err(ChannelError::Destroyed);
        }
        self.inner
            .send_end
            .lock()
            .take()
            .map(|stream| SendEndpoint { stream })
            .ok_or(ChannelError::EndpointTaken)
    }

    pub fn is_active(&self) -> bool {
        !self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Stop listening and close both local endpoints; safe to call repeatedly
    pub fn destroy(&self) {
        if self.inner.teardown() {
            tracing::debug!("Data channel destroyed");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("listener", &*self.inner.listener.lock())
            .field("active", &self.is_active())
            .finish()
    }
}

/// The write end of a data channel in transit to the broker
#[derive(Debug)]
pub struct SendEndpoint {
    stream: UnixStream,
}

impl SendEndpoint {
    pub fn into_sender(self, policy: SendPolicy) -> FrameSender {
        FrameSender::new(self.stream, policy)
    }
}

/// Write retry and backlog limits
#[derive(Debug, Clone)]
pub struct SendPolicy {
    /// Default: 5
    pub retry_attempts: u32,
    /// Default: 500µs
    pub retry_interval: Duration,
    /// Frames allowed to wait for the socket. Default: 256
    pub max_pending_frames: usize,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_interval: Duration::from_micros(500),
            max_pending_frames: 256,
        }
    }
}

/// Outcome of a send that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Everything, including older backlog, reached the socket
    Flushed,
    /// Some frames are still waiting in the backlog
    Pending { frames: usize },
}

#[derive(Debug, Default)]
struct Backlog {
    frames: VecDeque<Bytes>,
    /// Bytes of the front frame already written
    offset: usize,
}

/// Broker side writer for one data channel
#[derive(Debug)]
pub struct FrameSender {
    stream: UnixStream,
    policy: SendPolicy,
    backlog: Mutex<Backlog>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl FrameSender {
    fn new(stream: UnixStream, policy: SendPolicy) -> Self {
        Self {
            stream,
            policy,
            backlog: Mutex::new(Backlog::default()),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `frames` after any backlog and write as much as the socket takes
    pub fn send(&self, frames: &[EventFrame]) -> Result<SendStatus> {
        let mut backlog = self.backlog.lock();
        backlog.frames.extend(frames.iter().map(EventFrame::encode));
        let written = self.drain(&mut backlog);
        self.enforce_bound(&mut backlog);
        written?;
        Ok(Self::status(&backlog))
    }

    /// Retry the backlog without adding frames
    pub fn flush(&self) -> Result<SendStatus> {
        let mut backlog = self.backlog.lock();
        self.drain(&mut backlog)?;
        Ok(Self::status(&backlog))
    }

    pub fn pending_frames(&self) -> usize {
        self.backlog.lock().frames.len()
    }

    /// Frames fully written to the socket
    pub fn sent_frames(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames discarded because the backlog was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A second handle on the socket, for watching the peer disconnect
    pub fn watch_handle(&self) -> Result<UnixStream> {
        Ok(self.stream.try_clone()?)
    }

    fn status(backlog: &Backlog) -> SendStatus {
        if backlog.frames.is_empty() {
            SendStatus::Flushed
        } else {
            SendStatus::Pending {
                frames: backlog.frames.len(),
            }
        }
    }

    fn drain(&self, backlog: &mut Backlog) -> Result<()> {
        let mut retries = 0;
        loop {
            let (frame_len, result) = match backlog.frames.front() {
                Some(front) => (front.len(), (&self.stream).write(&front[backlog.offset..])),
                None => return Ok(()),
            };
            match result {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    backlog.offset += n;
                    if backlog.offset == frame_len {
                        backlog.frames.pop_front();
                        backlog.offset = 0;
                        self.sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if retries >= self.policy.retry_attempts {
                        return Ok(());
                    }
                    retries += 1;
                    thread::sleep(self.policy.retry_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn enforce_bound(&self, backlog: &mut Backlog) {
        let mut dropped = 0u64;
        while backlog.frames.len() > self.policy.max_pending_frames {
            // Never drop a frame that is half on the wire
            let victim = if backlog.offset > 0 { 1 } else { 0 };
            if backlog.frames.remove(victim).is_none() {
                break;
            }
            dropped += 1;
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            tracing::warn!(
                "Data channel backlog full, dropped {} oldest frames ({} total)",
                dropped,
                self.dropped_frames()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use sensor_hal::{SensorIdentity, SensorType};

    use crate::frame::FRAME_SIZE;

    fn frame(ts: i64) -> EventFrame {
        EventFrame::new(SensorIdentity::local(0, SensorType::BAROMETER), ts, &[ts as u8]).unwrap()
    }

    fn raw_sender(policy: SendPolicy) -> (FrameSender, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (FrameSender::new(a, policy), b)
    }

    #[test]
    fn test_send_reaches_peer() {
        let (sender, mut peer) = raw_sender(SendPolicy::default());
        assert_eq!(sender.send(&[frame(1), frame(2)]).unwrap(), SendStatus::Flushed);
        let mut buf = vec![0u8; FRAME_SIZE * 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(sender.sent_frames(), 2);
        assert_eq!(sender.pending_frames(), 0);
    }

    #[test]
    fn test_full_socket_bounds_backlog() {
        let policy = SendPolicy {
            retry_attempts: 1,
            retry_interval: Duration::from_micros(10),
            max_pending_frames: 8,
        };
        let (sender, mut peer) = raw_sender(policy);

        // Nobody reads, so the socket buffer eventually fills
        let batch: Vec<EventFrame> = (0..64).map(frame).collect();
        let mut status = SendStatus::Flushed;
        for _ in 0..20_000 {
            status = sender.send(&batch).unwrap();
            if sender.dropped_frames() > 0 {
                break;
            }
        }
        assert!(matches!(status, SendStatus::Pending { .. }));
        assert!(sender.pending_frames() <= 8);
        assert!(sender.dropped_frames() > 0);

        // The stream stays frame aligned after drops
        let mut buf = vec![0u8; FRAME_SIZE];
        peer.read_exact(&mut buf).unwrap();
        let raw: &[u8; FRAME_SIZE] = buf.as_slice().try_into().unwrap();
        assert!(EventFrame::decode(raw).is_ok());
    }

    #[test]
    fn test_send_to_closed_peer_fails() {
        let (sender, peer) = raw_sender(SendPolicy::default());
        drop(peer);
        assert!(sender.send(&[frame(1)]).is_err());
    }

    #[test]
    fn test_endpoint_is_taken_once() {
        let readiness = ReadinessLoop::start("test-endpoint").unwrap();
        let transport = Transport::create(&readiness, Arc::new(|_| {})).unwrap();
        assert!(transport.take_send_endpoint().is_ok());
        assert!(matches!(
            transport.take_send_endpoint(),
            Err(ChannelError::EndpointTaken)
        ));
        transport.destroy();
        assert!(matches!(
            transport.take_send_endpoint(),
            Err(ChannelError::Destroyed)
        ));
    }
}
