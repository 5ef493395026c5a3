//! Fan-out of drained events to client channels
//!
//! Event-driven sensors (on-change, one-shot) reach every subscriber
//! immediately. Continuous sensors run at the best rate of all subscribers,
//! so a slower client only receives every n-th event, where n is its
//! [`batch_ratio`](sensor_store::SubscriptionStore::batch_ratio). The first
//! event after subscribing is always delivered. Clients that asked for a
//! report delay get their events grouped into FIFO-sized bursts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sensor_channel::{EventFrame, SendStatus};
use sensor_hal::{ReportingMode, SensorIdentity};

use crate::client::{ClientChannel, ClientStore};

/// Per (sensor, client) decimation state
#[derive(Debug, Default)]
struct Cursor {
    count: u64,
    cache: Vec<EventFrame>,
}

impl Cursor {
    /// Whether this event is the client's turn; a ratio of 1 or less takes every event
    fn advance(&mut self, ratio: u64) -> bool {
        if ratio <= 1 {
            return true;
        }
        let due = self.count % ratio == 0;
        self.count = (self.count + 1) % ratio;
        due
    }
}

/// Counters for one dispatch pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub frames: usize,
    pub delivered: usize,
    pub clients: usize,
}

type Outgoing = HashMap<i32, (Arc<ClientChannel>, Vec<EventFrame>)>;

pub struct Dispatcher {
    store: Arc<ClientStore>,
    cursors: DashMap<(SensorIdentity, i32), Cursor>,
    delivered: AtomicU64,
}

impl Dispatcher {
    pub fn new(store: Arc<ClientStore>) -> Self {
        Self {
            store,
            cursors: DashMap::new(),
            delivered: AtomicU64::new(0),
        }
    }

    /// Route a drained batch, writing at most once per client
    pub fn dispatch(&self, frames: &[EventFrame]) -> DispatchStats {
        let mut outgoing: Outgoing = HashMap::new();
        for frame in frames {
            self.route(frame, &mut outgoing);
        }

        let mut stats = DispatchStats {
            frames: frames.len(),
            ..Default::default()
        };
        for (pid, (channel, batch)) in outgoing {
            if batch.is_empty() {
                continue;
            }
            stats.clients += 1;
            match channel.send(&batch) {
                Ok(SendStatus::Flushed) => {
                    stats.delivered += batch.len();
                }
                Ok(SendStatus::Pending { frames }) => {
                    stats.delivered += batch.len();
                    tracing::trace!(pid, pending = frames, "Client is behind");
                }
                Err(e) => {
                    tracing::debug!(pid, "Sending {} frames failed: {}", batch.len(), e);
                }
            }
        }
        self.delivered.fetch_add(stats.delivered as u64, Ordering::Relaxed);
        stats
    }

    fn route(&self, frame: &EventFrame, outgoing: &mut Outgoing) {
        let sensor = frame.identity();
        self.store.record_last_event(sensor, *frame);
        self.store.update_recent_events(sensor, *frame);

        let event_driven = ReportingMode::from_raw(frame.mode).is_some_and(|m| m.is_event_driven());
        for (pid, channel) in self.store.channels_for_sensor(sensor) {
            if !channel.is_active() {
                continue;
            }
            let batch = &mut outgoing
                .entry(pid)
                .or_insert_with(|| (Arc::clone(&channel), Vec::new()))
                .1;
            if event_driven {
                batch.push(*frame);
                continue;
            }

            let ratio = self.store.batch_ratio(sensor, pid);
            let fifo = self.store.fifo_ratio(sensor, pid);
            let mut cursor = self.cursors.entry((sensor, pid)).or_default();
            if !cursor.advance(ratio) {
                continue;
            }
            if fifo > 1 {
                cursor.cache.push(*frame);
                if cursor.cache.len() as u64 >= fifo {
                    batch.append(&mut cursor.cache);
                }
            } else {
                batch.push(*frame);
            }
        }
    }

    /// Drop decimation state of a departed client
    pub fn forget_client(&self, pid: i32) {
        self.cursors.retain(|(_, owner), _| *owner != pid);
    }

    /// Drop decimation state of a stopped sensor
    pub fn forget_sensor(&self, sensor: SensorIdentity) {
        self.cursors.retain(|(id, _), _| *id != sensor);
    }

    /// Frames handed to client sockets since startup
    pub fn delivered_frames(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cursors", &self.cursors.len())
            .field("delivered", &self.delivered_frames())
            .finish()
    }
}
