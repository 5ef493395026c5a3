//! Broker-side handle for one connected client process

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sensor_channel::{ChannelError, EventFrame, FrameSender, ListenerId, ReadinessLoop, SendStatus};
use sensor_store::SubscriptionStore;
use serde::{Deserialize, Serialize};

use crate::plug::SensorPlugEvent;

/// Subscription state keyed by client channels, with plug listeners as senders
pub type ClientStore = SubscriptionStore<ClientChannel, crossbeam::channel::Sender<SensorPlugEvent>>;

/// Who is handing a data channel to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub pid: i32,
    pub uid: i32,
    pub access_token: u32,
    pub package_name: String,
}

impl ClientRegistration {
    pub fn new(pid: i32, uid: i32, access_token: u32) -> Self {
        Self {
            pid,
            uid,
            access_token,
            package_name: String::new(),
        }
    }

    pub fn with_package_name(mut self, name: impl Into<String>) -> Self {
        self.package_name = name.into();
        self
    }
}

/// The broker's end of one client's data channel
///
/// Shared between the store and in-flight dispatch passes. The socket closes
/// once the last reference is dropped and the disconnect watch is gone.
#[derive(Debug)]
pub struct ClientChannel {
    registration: ClientRegistration,
    generation: u64,
    sender: FrameSender,
    watch: Mutex<Option<ListenerId>>,
    active: AtomicBool,
}

impl ClientChannel {
    pub(crate) fn new(registration: ClientRegistration, generation: u64, sender: FrameSender) -> Self {
        Self {
            registration,
            generation,
            sender,
            watch: Mutex::new(None),
            active: AtomicBool::new(true),
        }
    }

    pub fn pid(&self) -> i32 {
        self.registration.pid
    }

    pub fn uid(&self) -> i32 {
        self.registration.uid
    }

    pub fn access_token(&self) -> u32 {
        self.registration.access_token
    }

    pub fn package_name(&self) -> &str {
        &self.registration.package_name
    }

    /// Distinguishes successive channels bound by the same pid
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn sender(&self) -> &FrameSender {
        &self.sender
    }

    /// Write frames to the client; refused once the channel is closed
    pub fn send(&self, frames: &[EventFrame]) -> sensor_channel::Result<SendStatus> {
        if !self.is_active() {
            return Err(ChannelError::Destroyed);
        }
        self.sender.send(frames)
    }

    pub(crate) fn set_watch(&self, id: ListenerId) {
        *self.watch.lock() = Some(id);
    }

    /// Stop delivering and drop the disconnect watch
    pub(crate) fn close(&self, readiness: &ReadinessLoop) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.watch.lock().take() {
            readiness.deregister(id);
        }
        tracing::debug!(
            pid = self.pid(),
            sent = self.sender.sent_frames(),
            dropped = self.sender.dropped_frames(),
            "Client channel closed"
        );
    }
}
