//! The subscription store
//!
//! `SubscriptionStore<C, L>` holds every piece of per-client and per-sensor
//! bookkeeping the broker needs. `C` is the channel handle bound to each
//! client process and `L` is the plug-event listener handle; the store never
//! looks inside either.
//!
//! Each map sits behind its own lock and no method holds two locks at once,
//! so a slow caller on one map never blocks lookups on another. Every method
//! returns owned values; nothing hands out references into the maps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sensor_channel::EventFrame;
use sensor_hal::{SensorIdentity, SensorType};

use crate::permission;
use crate::record::{AppThreadInfo, BestActivation, ChannelInfo, SubscriptionRecord};

/// Capacity limits applied by the store
#[derive(Debug, Clone)]
pub struct StoreLimits {
    /// Subscriptions accepted per sensor. Default: 200
    pub max_clients_per_sensor: usize,
    /// Recent events kept per sensor for diagnostics. Default: 10
    pub recent_event_capacity: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_clients_per_sensor: 200,
            recent_event_capacity: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AppThread {
    uid: i32,
    access_token: u32,
}

/// Per-sensor, per-process subscription state
pub struct SubscriptionStore<C, L = ()> {
    limits: StoreLimits,
    subscriptions: Mutex<HashMap<SensorIdentity, HashMap<i32, SubscriptionRecord>>>,
    channels: Mutex<HashMap<i32, Arc<C>>>,
    app_threads: Mutex<HashMap<i32, AppThread>>,
    cmds: Mutex<HashMap<SensorType, HashMap<i32, Vec<i32>>>>,
    last_events: Mutex<HashMap<SensorIdentity, EventFrame>>,
    recent_events: Mutex<HashMap<SensorIdentity, VecDeque<EventFrame>>>,
    active_info_pids: Mutex<HashSet<i32>>,
    plug_listeners: Mutex<HashMap<i32, L>>,
    device_status: AtomicU32,
}

impl<C, L> SubscriptionStore<C, L> {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            subscriptions: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            app_threads: Mutex::new(HashMap::new()),
            cmds: Mutex::new(HashMap::new()),
            last_events: Mutex::new(HashMap::new()),
            recent_events: Mutex::new(HashMap::new()),
            active_info_pids: Mutex::new(HashSet::new()),
            plug_listeners: Mutex::new(HashMap::new()),
            device_status: AtomicU32::new(0),
        }
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Insert or overwrite the record for (sensor, pid) as enabled
    ///
    /// Returns false for negative rates or pids, and when the sensor already
    /// has the maximum number of subscribers.
    pub fn update_subscription(&self, sensor: SensorIdentity, pid: i32, period_ns: i64, delay_ns: i64) -> bool {
        if pid < 0 || period_ns < 0 || delay_ns < 0 {
            tracing::warn!(%sensor, pid, period_ns, delay_ns, "Rejected invalid subscription");
            return false;
        }
        let mut subscriptions = self.subscriptions.lock();
        let clients = subscriptions.entry(sensor).or_default();
        match clients.get_mut(&pid) {
            Some(record) => {
                record.period_ns = period_ns;
                record.delay_ns = delay_ns;
                record.enabled = true;
            }
            None => {
                if clients.len() >= self.limits.max_clients_per_sensor {
                    tracing::warn!(%sensor, pid, "Subscriber limit of {} reached", self.limits.max_clients_per_sensor);
                    if clients.is_empty() {
                        subscriptions.remove(&sensor);
                    }
                    return false;
                }
                clients.insert(pid, SubscriptionRecord::new(period_ns, delay_ns));
            }
        }
        true
    }

    /// Delete the record for (sensor, pid); returns whether one existed
    pub fn remove_subscription(&self, sensor: SensorIdentity, pid: i32) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(clients) = subscriptions.get_mut(&sensor) else {
            return false;
        };
        let removed = clients.remove(&pid).is_some();
        if clients.is_empty() {
            subscriptions.remove(&sensor);
        }
        removed
    }

    /// Remove every record of `sensor`; returns whether any existed
    pub fn clear_sensor(&self, sensor: SensorIdentity) -> bool {
        self.subscriptions.lock().remove(&sensor).is_some()
    }

    /// Minimum period and delay over the sensor's enabled records
    pub fn best_activation(&self, sensor: SensorIdentity) -> BestActivation {
        let subscriptions = self.subscriptions.lock();
        let Some(clients) = subscriptions.get(&sensor) else {
            return BestActivation::NONE;
        };
        clients
            .values()
            .filter(|r| r.enabled)
            .fold(BestActivation::NONE, |best, r| BestActivation {
                period_ns: best.period_ns.min(r.period_ns),
                delay_ns: best.delay_ns.min(r.delay_ns),
            })
    }

    /// Whether any client has the sensor enabled
    pub fn sensor_state(&self, sensor: SensorIdentity) -> bool {
        self.subscriptions
            .lock()
            .get(&sensor)
            .is_some_and(|clients| clients.values().any(|r| r.enabled))
    }

    pub fn current_record(&self, sensor: SensorIdentity, pid: i32) -> Option<SubscriptionRecord> {
        self.subscriptions
            .lock()
            .get(&sensor)
            .and_then(|clients| clients.get(&pid))
            .copied()
    }

    /// True iff `pid` holds at least one enabled record and nobody else does
    pub fn only_this_pid_enabled(&self, sensor: SensorIdentity, pid: i32) -> bool {
        let subscriptions = self.subscriptions.lock();
        let Some(clients) = subscriptions.get(&sensor) else {
            return false;
        };
        let mut found = false;
        for (owner, record) in clients {
            if !record.enabled {
                continue;
            }
            if *owner != pid {
                return false;
            }
            found = true;
        }
        found
    }

    /// How many hardware reports make up one report for this client
    ///
    /// `client_period / best_period`, or 0 when either is unknown or zero.
    pub fn batch_ratio(&self, sensor: SensorIdentity, pid: i32) -> u64 {
        let best = self.best_activation(sensor);
        let Some(record) = self.current_record(sensor, pid) else {
            return 0;
        };
        if best.is_none() || best.period_ns <= 0 {
            return 0;
        }
        (record.period_ns / best.period_ns).max(0) as u64
    }

    /// How many reports this client wants buffered per delivery
    pub fn fifo_ratio(&self, sensor: SensorIdentity, pid: i32) -> u64 {
        self.current_record(sensor, pid)
            .map(|r| r.fifo_count())
            .unwrap_or(0)
    }

    /// Every sensor `pid` holds a record for
    pub fn sensor_ids_for(&self, pid: i32) -> HashSet<SensorIdentity> {
        self.subscriptions
            .lock()
            .iter()
            .filter(|(_, clients)| clients.contains_key(&pid))
            .map(|(sensor, _)| *sensor)
            .collect()
    }

    /// Pids holding any record for `sensor`
    pub fn pids_for(&self, sensor: SensorIdentity) -> Vec<i32> {
        self.subscriptions
            .lock()
            .get(&sensor)
            .map(|clients| clients.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Flip `perm_granted` on every record of `pid` whose sensor has `sensor_type`
    pub fn update_perm_state(&self, pid: i32, sensor_type: SensorType, granted: bool) -> usize {
        let mut changed = 0;
        let mut subscriptions = self.subscriptions.lock();
        for (sensor, clients) in subscriptions.iter_mut() {
            if sensor.sensor_type != sensor_type {
                continue;
            }
            if let Some(record) = clients.get_mut(&pid) {
                record.perm_granted = granted;
                changed += 1;
            }
        }
        changed
    }

    /// Apply a permission change reported for an access token
    pub fn change_sensor_perm(&self, access_token: u32, permission_name: &str, granted: bool) -> usize {
        let Some(pid) = self.pid_for_token(access_token) else {
            tracing::debug!(access_token, "Permission change for unknown token");
            return 0;
        };
        let types = permission::sensor_types_for(permission_name);
        if types.is_empty() {
            tracing::debug!(permission_name, "Permission does not guard any sensor");
        }
        types
            .iter()
            .map(|t| self.update_perm_state(pid, *t, granted))
            .sum()
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Associate `channel` with `pid`, replacing any previous binding
    pub fn bind_channel(&self, pid: i32, channel: Arc<C>) -> bool {
        if pid < 0 {
            return false;
        }
        if self.channels.lock().insert(pid, channel).is_some() {
            tracing::debug!(pid, "Replaced existing channel binding");
        }
        true
    }

    pub fn channel_for(&self, pid: i32) -> Option<Arc<C>> {
        self.channels.lock().get(&pid).cloned()
    }

    /// Unbind the pid's channel and drop all of its subscription records
    ///
    /// Returns the unbound channel so the caller can close it.
    pub fn destroy_channel(&self, pid: i32) -> Option<Arc<C>> {
        let channel = self.channels.lock().remove(&pid);
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|_, clients| {
            clients.remove(&pid);
            !clients.is_empty()
        });
        channel
    }

    /// Channels of clients with a granted, enabled record for `sensor`
    pub fn channels_for_sensor(&self, sensor: SensorIdentity) -> Vec<(i32, Arc<C>)> {
        let pids: Vec<i32> = {
            let subscriptions = self.subscriptions.lock();
            match subscriptions.get(&sensor) {
                Some(clients) => clients
                    .iter()
                    .filter(|(_, r)| r.enabled && r.perm_granted)
                    .map(|(pid, _)| *pid)
                    .collect(),
                None => return Vec::new(),
            }
        };
        let channels = self.channels.lock();
        pids.into_iter()
            .filter_map(|pid| channels.get(&pid).map(|c| (pid, Arc::clone(c))))
            .collect()
    }

    pub fn channel_pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.channels.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Diagnostic snapshot of every subscription
    pub fn channel_info_snapshot(&self) -> Vec<ChannelInfo> {
        let records: Vec<(SensorIdentity, i32, SubscriptionRecord)> = {
            let subscriptions = self.subscriptions.lock();
            subscriptions
                .iter()
                .flat_map(|(sensor, clients)| clients.iter().map(move |(pid, r)| (*sensor, *pid, *r)))
                .collect()
        };
        records
            .into_iter()
            .map(|(sensor, pid, record)| {
                let uid = self.uid_for(pid);
                let cmds = uid
                    .map(|uid| self.cmd_list(sensor.sensor_type, uid))
                    .unwrap_or_default();
                ChannelInfo {
                    pid,
                    uid,
                    sensor,
                    period_ns: record.period_ns,
                    delay_ns: record.delay_ns,
                    fifo_count: record.fifo_count(),
                    cmds,
                }
            })
            .collect()
    }

    // ========================================================================
    // Client processes
    // ========================================================================

    pub fn update_app_thread_info(&self, pid: i32, uid: i32, access_token: u32) -> bool {
        if pid < 0 {
            return false;
        }
        self.app_threads.lock().insert(pid, AppThread { uid, access_token });
        true
    }

    pub fn app_thread_info(&self, pid: i32) -> Option<AppThreadInfo> {
        self.app_threads.lock().get(&pid).map(|t| AppThreadInfo {
            pid,
            uid: t.uid,
            access_token: t.access_token,
        })
    }

    pub fn uid_for(&self, pid: i32) -> Option<i32> {
        self.app_threads.lock().get(&pid).map(|t| t.uid)
    }

    pub fn token_for(&self, pid: i32) -> Option<u32> {
        self.app_threads.lock().get(&pid).map(|t| t.access_token)
    }

    pub fn pid_for_token(&self, access_token: u32) -> Option<i32> {
        self.app_threads
            .lock()
            .iter()
            .find(|(_, t)| t.access_token == access_token)
            .map(|(pid, _)| *pid)
    }

    pub fn destroy_app_thread_info(&self, pid: i32) -> bool {
        self.app_threads.lock().remove(&pid).is_some()
    }

    /// True when `pid` holds neither a channel nor an active-info registration
    pub fn calling_service(&self, pid: i32) -> bool {
        if self.channels.lock().contains_key(&pid) {
            return false;
        }
        !self.active_info_pids.lock().contains(&pid)
    }

    // ========================================================================
    // Command history
    // ========================================================================

    pub fn update_cmd(&self, sensor_type: SensorType, uid: i32, cmd: i32) {
        self.cmds
            .lock()
            .entry(sensor_type)
            .or_default()
            .entry(uid)
            .or_default()
            .push(cmd);
    }

    pub fn cmd_list(&self, sensor_type: SensorType, uid: i32) -> Vec<i32> {
        self.cmds
            .lock()
            .get(&sensor_type)
            .and_then(|by_uid| by_uid.get(&uid))
            .cloned()
            .unwrap_or_default()
    }

    /// Forget every command recorded for `uid`
    pub fn destroy_cmd(&self, uid: i32) {
        let mut cmds = self.cmds.lock();
        cmds.retain(|_, by_uid| {
            by_uid.remove(&uid);
            !by_uid.is_empty()
        });
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Overwrite the one-slot cache for the frame's sensor
    pub fn record_last_event(&self, sensor: SensorIdentity, frame: EventFrame) {
        self.last_events.lock().insert(sensor, frame);
    }

    pub fn last_event(&self, sensor: SensorIdentity) -> Option<EventFrame> {
        self.last_events.lock().get(&sensor).copied()
    }

    /// Rewrite the cached event in place; returns false when nothing is cached
    pub fn modify_last_event<F>(&self, sensor: SensorIdentity, modify: F) -> bool
    where
        F: FnOnce(&mut EventFrame),
    {
        match self.last_events.lock().get_mut(&sensor) {
            Some(frame) => {
                modify(frame);
                true
            }
            None => false,
        }
    }

    pub fn clear_last_events(&self) {
        self.last_events.lock().clear();
    }

    /// Append to the sensor's recent-event ring; heart rate is never kept
    pub fn update_recent_events(&self, sensor: SensorIdentity, frame: EventFrame) {
        if sensor.sensor_type == SensorType::HEART_RATE || self.limits.recent_event_capacity == 0 {
            return;
        }
        let mut recent = self.recent_events.lock();
        let ring = recent.entry(sensor).or_default();
        ring.push_back(frame);
        while ring.len() > self.limits.recent_event_capacity {
            ring.pop_front();
        }
    }

    pub fn recent_events_snapshot(&self) -> HashMap<SensorIdentity, Vec<EventFrame>> {
        self.recent_events
            .lock()
            .iter()
            .map(|(sensor, ring)| (*sensor, ring.iter().copied().collect()))
            .collect()
    }

    pub fn clear_recent_events(&self, sensor: SensorIdentity) {
        self.recent_events.lock().remove(&sensor);
    }

    // ========================================================================
    // Listeners and device status
    // ========================================================================

    pub fn add_active_info_pid(&self, pid: i32) -> bool {
        self.active_info_pids.lock().insert(pid)
    }

    pub fn remove_active_info_pid(&self, pid: i32) -> bool {
        self.active_info_pids.lock().remove(&pid)
    }

    pub fn active_info_pids(&self) -> Vec<i32> {
        self.active_info_pids.lock().iter().copied().collect()
    }

    pub fn add_plug_listener(&self, pid: i32, listener: L) {
        self.plug_listeners.lock().insert(pid, listener);
    }

    pub fn remove_plug_listener(&self, pid: i32) -> Option<L> {
        self.plug_listeners.lock().remove(&pid)
    }

    pub fn set_device_status(&self, status: u32) {
        self.device_status.store(status, Ordering::SeqCst);
    }

    pub fn device_status(&self) -> u32 {
        self.device_status.load(Ordering::SeqCst)
    }
}

impl<C, L: Clone> SubscriptionStore<C, L> {
    pub fn plug_listeners(&self) -> Vec<(i32, L)> {
        self.plug_listeners
            .lock()
            .iter()
            .map(|(pid, l)| (*pid, l.clone()))
            .collect()
    }
}

impl<C, L> Default for SubscriptionStore<C, L> {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}

impl<C, L> std::fmt::Debug for SubscriptionStore<C, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStore")
            .field("sensors", &self.subscriptions.lock().len())
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}
