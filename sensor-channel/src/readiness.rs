//! Single-threaded readiness loop for channel receive ends
//!
//! # Overview
//!
//! A [`ReadinessLoop`] owns one background thread running a current-thread
//! tokio runtime. Each registered socket gets a listener task on that
//! runtime which waits for readability, drains a bounded number of reads,
//! reassembles frames and hands them to the registered frame callback.
//!
//! When the peer closes its end or the socket fails, the listener removes
//! itself from the registry and invokes the close callback exactly once.
//! Explicit [`ReadinessLoop::deregister`] removes the listener first, so the
//! close callback never runs for a socket its owner tore down.
//!
//! # Example
//!
//! ```rust
//! use std::os::unix::net::UnixStream;
//! use std::sync::Arc;
//! use sensor_channel::ReadinessLoop;
//!
//! let readiness = ReadinessLoop::start("example-loop")?;
//! let (ours, _theirs) = UnixStream::pair()?;
//! let id = readiness.register(ours, Arc::new(|_frame| {}), Arc::new(|_reason| {}))?;
//! assert_eq!(readiness.listener_count(), 1);
//! assert!(readiness.deregister(id));
//! assert_eq!(readiness.listener_count(), 0);
//! # Ok::<(), sensor_channel::ChannelError>(())
//! ```

use std::fmt;
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::assembler::FrameAssembler;
use crate::error::{ChannelError, Result};
use crate::frame::{EventFrame, FRAME_SIZE};

/// Reads drained per readiness wake before yielding to other listeners
const MAX_READS_PER_WAKE: usize = 100;

const RECV_BUFFER_FRAMES: usize = 32;

/// Called on the loop thread for every decoded frame
pub type FrameCallback = Arc<dyn Fn(EventFrame) + Send + Sync>;

/// Called on the loop thread once a listener's socket closes
pub type CloseCallback = Arc<dyn Fn(CloseReason) + Send + Sync>;

/// Unique identifier of a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Why a listener stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The other end of the socket was closed
    PeerClosed,
    /// Reading failed with an unrecoverable error
    Failed(io::ErrorKind),
}

/// Handle to the readiness thread; cheap to clone
#[derive(Clone)]
pub struct ReadinessLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    name: String,
    handle: Handle,
    listeners: DashMap<ListenerId, AbortHandle>,
    next_id: AtomicU64,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReadinessLoop {
    /// Spawn the loop thread and wait until its runtime is up
    pub fn start(name: &str) -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("Failed to create tokio runtime for readiness loop: {}", e);
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(rt.handle().clone()));
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| ChannelError::Runtime("loop thread exited during startup".to_string()))?
            .map_err(ChannelError::Runtime)?;

        tracing::debug!("Readiness loop {} started", name);
        Ok(Self {
            inner: Arc::new(LoopInner {
                name: name.to_string(),
                handle,
                listeners: DashMap::new(),
                next_id: AtomicU64::new(1),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.shutdown_tx.lock().is_some()
    }

    /// Start listening on `stream`
    ///
    /// The stream is switched to non-blocking mode and owned by the
    /// listener from here on; it is closed when the listener ends.
    pub fn register(
        &self,
        stream: StdUnixStream,
        on_frame: FrameCallback,
        on_close: CloseCallback,
    ) -> Result<ListenerId> {
        if !self.is_running() {
            return Err(ChannelError::LoopStopped);
        }
        stream.set_nonblocking(true)?;
        let stream = {
            let _guard = self.inner.handle.enter();
            UnixStream::from_std(stream)?
        };

        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let registry = Arc::downgrade(&self.inner);
        let task = self.inner.handle.spawn(async move {
            // Wait until the registry holds our abort handle
            if armed_rx.await.is_err() {
                return;
            }
            let reason = listen(stream, on_frame).await;
            let still_registered = registry
                .upgrade()
                .map(|inner| inner.listeners.remove(&id).is_some())
                .unwrap_or(false);
            if still_registered {
                tracing::debug!("{} closed: {:?}", id, reason);
                on_close(reason);
            }
        });
        self.inner.listeners.insert(id, task.abort_handle());
        let _ = armed_tx.send(());
        Ok(id)
    }

    /// Stop a listener and close its socket; returns whether it was registered
    pub fn deregister(&self, id: ListenerId) -> bool {
        match self.inner.listeners.remove(&id) {
            Some((_, abort)) => {
                abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.inner.listeners.contains_key(&id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Stop the loop thread and drop every listener
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for ReadinessLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessLoop")
            .field("name", &self.inner.name)
            .field("listeners", &self.listener_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl LoopInner {
    fn shutdown(&self) {
        let Some(tx) = self.shutdown_tx.lock().take() else {
            return;
        };
        let _ = tx.send(());
        self.listeners.clear();

        if let Some(thread) = self.thread.lock().take() {
            // The last handle may be dropped by a callback on the loop thread itself
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                tracing::error!("Readiness loop {} panicked", self.name);
            }
        }
        tracing::debug!("Readiness loop {} stopped", self.name);
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn listen(stream: UnixStream, on_frame: FrameCallback) -> CloseReason {
    let mut assembler = FrameAssembler::new();
    let mut buf = vec![0u8; FRAME_SIZE * RECV_BUFFER_FRAMES];
    loop {
        if let Err(e) = stream.readable().await {
            return CloseReason::Failed(e.kind());
        }
        let mut reads = 0;
        while reads < MAX_READS_PER_WAKE {
            match stream.try_read(&mut buf) {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => {
                    assembler.feed(&buf[..n], |frame| on_frame(frame));
                    reads += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return CloseReason::Failed(e.kind()),
            }
        }
        if reads == MAX_READS_PER_WAKE {
            tokio::task::yield_now().await;
        }
    }
}
