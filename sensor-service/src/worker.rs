//! Background data-report thread
//!
//! The HAL callback only appends to the batch buffer and pokes this thread.
//! The thread drains the buffer and runs dispatch, so client socket writes
//! never happen on the hardware thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::select;
use parking_lot::Mutex;

use crate::batch::EventBatchBuffer;
use crate::dispatch::Dispatcher;
use crate::error::{BrokerError, Result};

/// Cheap handle the HAL callback uses to wake the report thread
#[derive(Debug, Clone)]
pub struct Waker {
    tx: Sender<()>,
}

impl Waker {
    /// Signal that frames are waiting; coalesces with a pending signal
    pub fn wake(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::trace!("Report worker already stopped");
            }
        }
    }
}

#[derive(Debug)]
pub struct ReportWorker {
    waker: Waker,
    shutdown: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReportWorker {
    pub fn spawn(buffer: Arc<EventBatchBuffer>, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let (wake_tx, wake_rx) = channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        let handle = thread::Builder::new()
            .name("sensor-report".to_string())
            .spawn(move || run(buffer, dispatcher, wake_rx, shutdown_rx))
            .map_err(|e| BrokerError::ResourceExhausted(format!("report thread: {e}")))?;
        Ok(Self {
            waker: Waker { tx: wake_tx },
            shutdown: shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Deliver what is buffered, then stop the thread; safe to call repeatedly
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.shutdown.try_send(());
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("Report worker panicked");
        }
    }
}

impl Drop for ReportWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    buffer: Arc<EventBatchBuffer>,
    dispatcher: Arc<Dispatcher>,
    wake: Receiver<()>,
    shutdown: Receiver<()>,
) {
    tracing::debug!("Report worker started");
    loop {
        select! {
            recv(wake) -> msg => {
                if msg.is_err() {
                    break;
                }
                report(&buffer, &dispatcher);
            }
            recv(shutdown) -> _ => break,
        }
    }
    report(&buffer, &dispatcher);
    tracing::debug!("Report worker stopped");
}

fn report(buffer: &EventBatchBuffer, dispatcher: &Dispatcher) {
    loop {
        let frames = buffer.drain();
        if frames.is_empty() {
            return;
        }
        let stats = dispatcher.dispatch(&frames);
        tracing::trace!(frames = stats.frames, delivered = stats.delivered, "Reported batch");
    }
}
