//! The sensor broker
//!
//! # Overview
//!
//! [`Broker`] owns the HAL binding, the batch buffer, the subscription store
//! and one [`ClientChannel`] per connected client process. Control calls
//! arrive on client request threads; raw events arrive on the HAL thread and
//! are reported from a dedicated worker thread.
//!
//! # Threads
//!
//! ```text
//! HAL thread ──push──> EventBatchBuffer ──drain──> report worker ──send──> clients
//!                                                       │
//! control calls ──service lock──> RateManager / HAL     └── SubscriptionStore lookups
//! readiness loop ──client closed──> process_death
//! ```
//!
//! Control calls that change hardware state hold the service lock for the
//! whole check-then-act sequence, so two clients enabling the same sensor
//! cause exactly one HAL enable.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use sensor_channel::{CloseCallback, CloseReason, EventFrame, FrameCallback, ReadinessLoop, SendEndpoint};
use sensor_hal::{
    DataCallback, HalBackend, HalConnection, HalEvent, PlugCallback, PlugStatus, ReportingMode, SensorDescriptor,
    SensorIdentity, SensorPlugInfo,
};
use sensor_store::{BestActivation, ChannelInfo};
use serde::{Deserialize, Serialize};

use crate::batch::EventBatchBuffer;
use crate::catalog::SensorCatalog;
use crate::client::{ClientChannel, ClientRegistration, ClientStore};
use crate::config::BrokerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{BrokerError, Result};
use crate::gate::{AllowAll, PermissionGate};
use crate::manager::RateManager;
use crate::plug::{ActiveInfo, SensorPlugEvent};
use crate::power::PowerPolicy;
use crate::worker::{ReportWorker, Waker};

/// Handle to a running broker
///
/// Clones share the same broker. It shuts down when the last clone is
/// dropped or [`Broker::shutdown`] is called.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

struct BrokerShared {
    config: BrokerConfig,
    hal: Arc<HalConnection>,
    catalog: Arc<SensorCatalog>,
    store: Arc<ClientStore>,
    buffer: Arc<EventBatchBuffer>,
    dispatcher: Arc<Dispatcher>,
    rates: Arc<RateManager>,
    power: PowerPolicy,
    readiness: ReadinessLoop,
    worker: ReportWorker,
    gate: Arc<dyn PermissionGate>,
    service_lock: Mutex<()>,
    active_info: DashMap<i32, Sender<ActiveInfo>>,
    generation: AtomicU64,
    dropped_events: Arc<AtomicU64>,
    shut_down: AtomicBool,
}

/// Recent events of one sensor, summarized for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEvents {
    pub sensor: SensorIdentity,
    pub timestamps: Vec<i64>,
}

/// Serializable snapshot of broker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerDump {
    pub backend: String,
    pub sensors: Vec<SensorDescriptor>,
    pub channels: Vec<ChannelInfo>,
    pub recent_events: Vec<RecentEvents>,
    pub suspended_pids: Vec<i32>,
    pub device_status: u32,
    pub delivered_frames: u64,
    pub dropped_events: u64,
}

impl Broker {
    /// Start a broker on the first backend that connects, granting every permission
    pub fn start(config: BrokerConfig, backends: Vec<Arc<dyn HalBackend>>) -> Result<Self> {
        Self::with_gate(config, backends, Arc::new(AllowAll))
    }

    /// Start a broker that consults `gate` before enabling sensors
    pub fn with_gate(
        config: BrokerConfig,
        backends: Vec<Arc<dyn HalBackend>>,
        gate: Arc<dyn PermissionGate>,
    ) -> Result<Self> {
        config.validate()?;
        let hal = Arc::new(HalConnection::probe(backends)?);
        let catalog = Arc::new(SensorCatalog::new(config.max_sensor_count));
        let loaded = catalog.load(hal.list_sensors()?);

        let store = Arc::new(ClientStore::new(config.store_limits()));
        let buffer = Arc::new(EventBatchBuffer::new(
            config.block_count,
            config.block_capacity,
            config.retention_history,
        ));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store)));
        let rates = Arc::new(RateManager::new(
            Arc::clone(&hal),
            Arc::clone(&store),
            Arc::clone(&catalog),
        ));
        let power = PowerPolicy::new(
            Arc::clone(&rates),
            Arc::clone(&hal),
            Arc::clone(&store),
            config.max_sensor_count,
            config.max_event_count,
        );
        let readiness = ReadinessLoop::start("sensor-broker")?;
        let worker = ReportWorker::spawn(Arc::clone(&buffer), Arc::clone(&dispatcher))?;
        let dropped_events = Arc::new(AtomicU64::new(0));

        let data_callback = event_sink(Arc::clone(&buffer), worker.waker(), Arc::clone(&dropped_events));
        let plug_callback = plug_sink(Arc::downgrade(&hal), Arc::clone(&catalog), Arc::clone(&store));

        let shared = Arc::new(BrokerShared {
            config,
            hal,
            catalog,
            store,
            buffer,
            dispatcher,
            rates,
            power,
            readiness,
            worker,
            gate,
            service_lock: Mutex::new(()),
            active_info: DashMap::new(),
            generation: AtomicU64::new(0),
            dropped_events,
            shut_down: AtomicBool::new(false),
        });

        shared.hal.register_callback(data_callback)?;
        if let Err(e) = shared.hal.register_plug_callback(plug_callback) {
            tracing::warn!("Plug callback registration failed: {}", e);
        }
        tracing::info!(
            backend = shared.hal.backend_name(),
            sensors = loaded,
            "Sensor broker started"
        );
        Ok(Self { shared })
    }

    fn from_shared(shared: Arc<BrokerShared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.hal.backend_name()
    }

    /// Every enumerated sensor
    pub fn sensor_list(&self) -> Vec<SensorDescriptor> {
        self.shared.catalog.list()
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Bind a client's send endpoint and start watching for its disconnect
    pub fn transfer_data_channel(&self, registration: ClientRegistration, endpoint: SendEndpoint) -> Result<()> {
        let pid = registration.pid;
        if pid < 0 {
            return Err(BrokerError::InvalidPid(pid));
        }
        let shared = &self.shared;
        let _guard = shared.service_lock.lock();

        let sender = endpoint.into_sender(shared.config.send_policy());
        let watch = sender.watch_handle()?;
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = Arc::new(ClientChannel::new(registration.clone(), generation, sender));

        let weak = Arc::downgrade(&self.shared);
        let on_close: CloseCallback = Arc::new(move |reason: CloseReason| {
            if let Some(shared) = weak.upgrade() {
                Broker::from_shared(shared).on_client_closed(pid, generation, reason);
            }
        });
        let on_frame: FrameCallback = Arc::new(move |_frame: EventFrame| {
            tracing::trace!(pid, "Ignoring frame sent by client");
        });
        // Watch first so a channel is never bound without a disconnect watch
        let id = shared.readiness.register(watch, on_frame, on_close)?;
        channel.set_watch(id);

        shared
            .store
            .update_app_thread_info(pid, registration.uid, registration.access_token);
        if let Some(previous) = shared.store.channel_for(pid) {
            tracing::debug!(pid, "Replacing data channel");
            previous.close(&shared.readiness);
        }
        shared.store.bind_channel(pid, channel);

        tracing::info!(
            pid,
            uid = registration.uid,
            package = %registration.package_name,
            "Data channel transferred"
        );
        Ok(())
    }

    /// Unbind a client's channel; sensors it still holds are stopped first
    pub fn destroy_sensor_channel(&self, pid: i32) -> Result<()> {
        if pid < 0 {
            return Err(BrokerError::InvalidPid(pid));
        }
        let shared = &self.shared;
        let _guard = shared.service_lock.lock();
        for sensor in shared.store.sensor_ids_for(pid) {
            if let Err(e) = self.disable_locked(pid, sensor) {
                tracing::warn!(%sensor, pid, "Disabling sensor of destroyed channel failed: {}", e);
            }
        }
        let Some(channel) = shared.store.destroy_channel(pid) else {
            tracing::warn!(pid, "No data channel to destroy");
            return Err(BrokerError::ChannelError(sensor_channel::ChannelError::Destroyed));
        };
        channel.close(&shared.readiness);
        shared.store.destroy_cmd(channel.uid());
        shared.dispatcher.forget_client(pid);
        tracing::info!(pid, "Data channel destroyed");
        Ok(())
    }

    fn on_client_closed(&self, pid: i32, generation: u64, reason: CloseReason) {
        // A close racing the transfer waits here until the channel is bound
        let _guard = self.shared.service_lock.lock();
        match self.shared.store.channel_for(pid) {
            Some(channel) if channel.generation() == generation => {
                tracing::info!(pid, ?reason, "Client disconnected");
                self.release_client_locked(pid);
            }
            _ => tracing::debug!(pid, generation, "Stale disconnect notification"),
        }
    }

    /// Release everything a departed client held
    pub fn process_death(&self, pid: i32) {
        let _guard = self.shared.service_lock.lock();
        self.release_client_locked(pid);
    }

    fn release_client_locked(&self, pid: i32) {
        let shared = &self.shared;
        shared.power.forget(pid);
        for sensor in shared.store.sensor_ids_for(pid) {
            if let Err(e) = self.disable_locked(pid, sensor) {
                tracing::warn!(%sensor, pid, "Disabling sensor of dead client failed: {}", e);
            }
        }
        shared.active_info.remove(&pid);
        shared.store.remove_active_info_pid(pid);
        shared.store.remove_plug_listener(pid);

        let uid = shared.store.uid_for(pid);
        if let Some(channel) = shared.store.destroy_channel(pid) {
            channel.close(&shared.readiness);
        }
        shared.store.destroy_app_thread_info(pid);
        if let Some(uid) = uid {
            shared.store.destroy_cmd(uid);
        }
        shared.dispatcher.forget_client(pid);
        tracing::info!(pid, "Client resources released");
    }

    // ========================================================================
    // Sensor control
    // ========================================================================

    /// Subscribe `pid` to `sensor` at the requested rate
    ///
    /// The first subscriber enables the hardware. Later subscribers only
    /// update the rate; for event-driven sensors they receive the last event
    /// right away.
    pub fn enable_sensor(&self, pid: i32, sensor: SensorIdentity, period_ns: i64, delay_ns: i64) -> Result<()> {
        let shared = &self.shared;
        if pid < 0 {
            return Err(BrokerError::InvalidPid(pid));
        }
        if period_ns < 0 || delay_ns < 0 {
            return Err(BrokerError::InvalidArgument(format!(
                "negative rate {period_ns}/{delay_ns} for {sensor}"
            )));
        }
        let token = shared.store.token_for(pid).unwrap_or_default();
        if !shared.gate.check(token, sensor.sensor_type) {
            tracing::warn!(%sensor, pid, "Permission denied");
            return Err(BrokerError::PermissionDenied {
                sensor_type: sensor.sensor_type,
            });
        }
        if !shared.catalog.contains(&sensor) {
            return Err(BrokerError::InvalidArgument(format!("unknown sensor {sensor}")));
        }
        if period_ns != 0 && delay_ns != 0 && delay_ns / period_ns > shared.config.max_event_count {
            return Err(BrokerError::InvalidArgument(format!(
                "report delay {delay_ns} exceeds {} events at period {period_ns}",
                shared.config.max_event_count
            )));
        }

        let replay = {
            let _guard = shared.service_lock.lock();
            self.enable_locked(pid, sensor, period_ns, delay_ns)?
        };
        // Sent unlocked; a congested client may spend the whole retry budget
        if let Some(frame) = replay {
            self.replay_last_event(sensor, pid, frame);
        }
        Ok(())
    }

    /// Returns the event a joining subscriber should get right away
    fn enable_locked(
        &self,
        pid: i32,
        sensor: SensorIdentity,
        period_ns: i64,
        delay_ns: i64,
    ) -> Result<Option<EventFrame>> {
        let shared = &self.shared;
        if shared.store.sensor_state(sensor) {
            tracing::debug!(%sensor, pid, "Sensor already enabled, joining");
            self.save_subscriber(sensor, pid, period_ns, delay_ns)?;
            self.report_active_info(sensor, pid);
            return Ok(self.event_to_replay(sensor));
        }

        self.save_subscriber(sensor, pid, period_ns, delay_ns)?;
        if let Err(e) = shared.hal.enable(&sensor) {
            tracing::error!(%sensor, pid, "HAL enable failed: {}", e);
            shared.store.remove_subscription(sensor, pid);
            return Err(e.into());
        }
        tracing::info!(%sensor, pid, period_ns, delay_ns, "Sensor enabled");
        self.report_active_info(sensor, pid);
        Ok(None)
    }

    fn save_subscriber(&self, sensor: SensorIdentity, pid: i32, period_ns: i64, delay_ns: i64) -> Result<()> {
        let shared = &self.shared;
        if !shared.rates.save_subscriber(sensor, pid, period_ns, delay_ns) {
            return Err(BrokerError::ResourceExhausted(format!(
                "subscriber limit reached for {sensor}"
            )));
        }
        let record = shared
            .store
            .current_record(sensor, pid)
            .ok_or(BrokerError::NotSubscribed { pid, sensor })?;
        if let Err(e) = shared.rates.set_best_params(sensor, record.period_ns, record.delay_ns) {
            shared.store.remove_subscription(sensor, pid);
            return Err(e);
        }
        Ok(())
    }

    fn event_to_replay(&self, sensor: SensorIdentity) -> Option<EventFrame> {
        let frame = self.shared.store.last_event(sensor)?;
        ReportingMode::from_raw(frame.mode)
            .is_some_and(|m| m.is_event_driven())
            .then_some(frame)
    }

    fn replay_last_event(&self, sensor: SensorIdentity, pid: i32, frame: EventFrame) {
        let Some(channel) = self.shared.store.channel_for(pid) else {
            return;
        };
        if let Err(e) = channel.send(&[frame]) {
            tracing::debug!(%sensor, pid, "Replaying last event failed: {}", e);
        }
    }

    fn report_active_info(&self, sensor: SensorIdentity, pid: i32) {
        let shared = &self.shared;
        if shared.active_info.is_empty() {
            return;
        }
        let Some(record) = shared.store.current_record(sensor, pid) else {
            return;
        };
        let info = ActiveInfo {
            pid,
            sensor,
            period_ns: record.period_ns,
            delay_ns: record.delay_ns,
        };
        shared.active_info.retain(|listener, tx| {
            let alive = tx.send(info).is_ok();
            if !alive {
                tracing::debug!(listener = *listener, "Active info listener went away");
            }
            alive
        });
    }

    /// Drop `pid`'s subscription; the last subscriber stops the hardware
    pub fn disable_sensor(&self, pid: i32, sensor: SensorIdentity) -> Result<()> {
        let shared = &self.shared;
        if !shared.catalog.contains(&sensor) && !shared.store.sensor_state(sensor) {
            return Err(BrokerError::InvalidArgument(format!("unknown sensor {sensor}")));
        }
        if pid < 0 {
            return Err(BrokerError::InvalidPid(pid));
        }
        let _guard = shared.service_lock.lock();
        self.disable_locked(pid, sensor)
    }

    fn disable_locked(&self, pid: i32, sensor: SensorIdentity) -> Result<()> {
        let shared = &self.shared;
        if shared.rates.is_other_client_using(sensor, pid) {
            tracing::debug!(%sensor, pid, "Other clients still use the sensor");
            return Ok(());
        }
        if let Err(e) = shared.hal.disable(&sensor) {
            if shared.catalog.contains(&sensor) {
                tracing::error!(%sensor, pid, "HAL disable failed: {}", e);
                return Err(e.into());
            }
            tracing::warn!(%sensor, pid, "HAL disable of detached sensor failed: {}", e);
        }
        if let Some(uid) = shared.store.uid_for(pid) {
            shared.store.destroy_cmd(uid);
        }
        shared.store.clear_recent_events(sensor);
        shared.rates.after_disable(sensor);
        shared.dispatcher.forget_sensor(sensor);
        tracing::info!(%sensor, pid, "Sensor disabled");
        Ok(())
    }

    pub fn set_mode(&self, pid: i32, sensor: SensorIdentity, mode: i32) -> Result<()> {
        let shared = &self.shared;
        if !shared.catalog.contains(&sensor) {
            return Err(BrokerError::InvalidArgument(format!("unknown sensor {sensor}")));
        }
        shared.hal.set_mode(&sensor, mode)?;
        if let Some(uid) = shared.store.uid_for(pid) {
            shared.store.update_cmd(sensor.sensor_type, uid, mode);
        }
        Ok(())
    }

    pub fn set_option(&self, sensor: SensorIdentity, option: i32) -> Result<()> {
        let shared = &self.shared;
        if !shared.catalog.contains(&sensor) {
            return Err(BrokerError::InvalidArgument(format!("unknown sensor {sensor}")));
        }
        shared.hal.set_option(&sensor, option)?;
        Ok(())
    }

    // ========================================================================
    // Power policy and notifications
    // ========================================================================

    pub fn suspend_sensors(&self, pid: i32) -> Result<()> {
        if pid < 0 {
            return Err(BrokerError::InvalidPid(pid));
        }
        let _guard = self.shared.service_lock.lock();
        for sensor in self.shared.power.suspend(pid)? {
            self.shared.dispatcher.forget_sensor(sensor);
        }
        Ok(())
    }

    pub fn resume_sensors(&self, pid: i32) -> Result<()> {
        if pid < 0 {
            return Err(BrokerError::InvalidPid(pid));
        }
        let _guard = self.shared.service_lock.lock();
        self.shared.power.resume(pid)
    }

    /// Resume every suspended client
    pub fn reset_sensors(&self) -> Result<()> {
        let _guard = self.shared.service_lock.lock();
        self.shared.power.reset()
    }

    pub fn get_active_info_list(&self, pid: i32) -> Result<Vec<ActiveInfo>> {
        if pid < 0 {
            return Err(BrokerError::InvalidPid(pid));
        }
        Ok(self.shared.power.active_info_list(pid))
    }

    /// Receive an [`ActiveInfo`] whenever a client enables a sensor
    pub fn enable_active_info_cb(&self, pid: i32) -> Receiver<ActiveInfo> {
        let (tx, rx) = channel::unbounded();
        self.shared.store.add_active_info_pid(pid);
        self.shared.active_info.insert(pid, tx);
        rx
    }

    pub fn disable_active_info_cb(&self, pid: i32) -> bool {
        self.shared.store.remove_active_info_pid(pid);
        self.shared.active_info.remove(&pid).is_some()
    }

    /// Receive a [`SensorPlugEvent`] whenever a sensor is attached or detached
    pub fn subscribe_plug_events(&self, pid: i32) -> Receiver<SensorPlugEvent> {
        let (tx, rx) = channel::unbounded();
        self.shared.store.add_plug_listener(pid, tx);
        rx
    }

    pub fn unsubscribe_plug_events(&self, pid: i32) -> bool {
        self.shared.store.remove_plug_listener(pid).is_some()
    }

    pub fn set_device_status(&self, status: u32) {
        tracing::info!(status, "Device status changed");
        self.shared.store.set_device_status(status);
    }

    pub fn device_status(&self) -> u32 {
        self.shared.store.device_status()
    }

    /// Apply a permission grant or revocation for the holder of `access_token`
    pub fn change_sensor_perm(&self, access_token: u32, permission_name: &str, granted: bool) -> usize {
        let changed = self
            .shared
            .store
            .change_sensor_perm(access_token, permission_name, granted);
        tracing::info!(access_token, permission_name, granted, changed, "Sensor permission changed");
        changed
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn best_activation(&self, sensor: SensorIdentity) -> BestActivation {
        self.shared.store.best_activation(sensor)
    }

    pub fn subscribed_sensors(&self, pid: i32) -> HashSet<SensorIdentity> {
        self.shared.store.sensor_ids_for(pid)
    }

    pub fn has_channel(&self, pid: i32) -> bool {
        self.shared.store.channel_for(pid).is_some()
    }

    pub fn channel_count(&self) -> usize {
        self.shared.store.channel_count()
    }

    pub fn is_suspended(&self, pid: i32) -> bool {
        self.shared.power.is_suspended(pid)
    }

    /// HAL events dropped because the batch buffer was full
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped_events.load(Ordering::Relaxed)
    }

    pub fn dump(&self) -> BrokerDump {
        let shared = &self.shared;
        let mut recent_events: Vec<RecentEvents> = shared
            .store
            .recent_events_snapshot()
            .into_iter()
            .map(|(sensor, frames)| RecentEvents {
                sensor,
                timestamps: frames.iter().map(|f| f.timestamp).collect(),
            })
            .collect();
        recent_events.sort_by_key(|r| (r.sensor.device_id, r.sensor.sensor_type.as_raw(), r.sensor.sensor_index));
        BrokerDump {
            backend: shared.hal.backend_name().to_string(),
            sensors: shared.catalog.list(),
            channels: shared.store.channel_info_snapshot(),
            recent_events,
            suspended_pids: shared.power.suspended_pids(),
            device_status: shared.store.device_status(),
            delivered_frames: shared.dispatcher.delivered_frames(),
            dropped_events: self.dropped_events(),
        }
    }

    pub fn dump_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.dump())?)
    }

    /// Stop reporting, close every client channel and release the HAL
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }
}

impl BrokerShared {
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.hal.unregister() {
            tracing::warn!("HAL unregister failed: {}", e);
        }
        self.worker.stop();
        let pending = self.buffer.pending();
        if pending > 0 {
            tracing::debug!(pending, "Discarding undelivered events");
        }
        self.readiness.shutdown();
        for pid in self.store.active_info_pids() {
            self.active_info.remove(&pid);
        }
        for pid in self.store.channel_pids() {
            if let Some(channel) = self.store.destroy_channel(pid) {
                channel.close(&self.readiness);
            }
        }
        if let Err(e) = self.hal.destroy() {
            tracing::warn!("HAL destroy failed: {}", e);
        }
        tracing::info!("Sensor broker stopped");
    }
}

impl Drop for BrokerShared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("backend", &self.backend_name())
            .field("sensors", &self.shared.catalog.len())
            .field("channels", &self.channel_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// HAL data callback: convert, buffer and wake the report worker
fn event_sink(buffer: Arc<EventBatchBuffer>, waker: Waker, dropped: Arc<AtomicU64>) -> DataCallback {
    Arc::new(move |event: HalEvent| {
        let frame = EventFrame::from_hal_event(&event);
        if let Err(e) = buffer.push(frame) {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(sensor = %event.identity, total, "Dropping HAL event: {}", e);
        }
        waker.wake();
    })
}

/// HAL plug callback: keep the catalog current and notify listeners
fn plug_sink(hal: Weak<HalConnection>, catalog: Arc<SensorCatalog>, store: Arc<ClientStore>) -> PlugCallback {
    Arc::new(move |info: SensorPlugInfo| {
        let Some(hal) = hal.upgrade() else {
            return;
        };
        apply_plug_event(&hal, &catalog, &info);
        let event = SensorPlugEvent::from_info(&info);
        for (pid, listener) in store.plug_listeners() {
            if listener.send(event.clone()).is_err() {
                tracing::debug!(pid, "Plug listener went away");
                store.remove_plug_listener(pid);
            }
        }
    })
}

fn apply_plug_event(hal: &HalConnection, catalog: &SensorCatalog, info: &SensorPlugInfo) {
    match info.status {
        PlugStatus::Online => match hal.list_sensors_by_device(info.identity.device_id) {
            Ok(found) => {
                let added = catalog.insert_all(found);
                tracing::info!(sensor = %info.identity, device = %info.device_name, added, "Sensor attached");
            }
            Err(e) => tracing::warn!(sensor = %info.identity, "Enumerating attached device failed: {}", e),
        },
        PlugStatus::Offline => {
            hal.erase_plugged_sensor(info);
            catalog.remove(&info.identity);
            tracing::info!(sensor = %info.identity, device = %info.device_name, "Sensor detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_hal::{CompatibleBackend, SensorType};

    fn broker() -> (Arc<CompatibleBackend>, Broker) {
        let backend = Arc::new(CompatibleBackend::with_default_sensors(1));
        let broker = Broker::start(BrokerConfig::default(), vec![backend.clone() as Arc<dyn HalBackend>]).unwrap();
        (backend, broker)
    }

    #[test]
    fn test_start_loads_sensor_list() {
        let (_, broker) = broker();
        assert_eq!(broker.backend_name(), "compatible");
        assert_eq!(broker.sensor_list().len(), 4);
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let backend: Arc<dyn HalBackend> = Arc::new(CompatibleBackend::with_default_sensors(1));
        let config = BrokerConfig {
            block_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            Broker::start(config, vec![backend]),
            Err(BrokerError::Configuration(_))
        ));
    }

    #[test]
    fn test_enable_rejects_bad_arguments() {
        let (_, broker) = broker();
        let sar = SensorIdentity::local(1, SensorType::SAR);
        let unknown = SensorIdentity::local(9, SensorType::SAR);
        assert!(matches!(broker.enable_sensor(-1, sar, 1, 0), Err(BrokerError::InvalidPid(-1))));
        assert!(matches!(
            broker.enable_sensor(1, sar, -1, 0),
            Err(BrokerError::InvalidArgument(_))
        ));
        assert!(matches!(
            broker.enable_sensor(1, unknown, 100_000_000, 0),
            Err(BrokerError::InvalidArgument(_))
        ));
        assert!(matches!(
            broker.enable_sensor(1, sar, 100_000_000, 100_000_000 * 1001),
            Err(BrokerError::InvalidArgument(_))
        ));
        assert!(broker.best_activation(sar).is_none());
    }

    #[test]
    fn test_gate_denies_before_any_state_changes() {
        let backend = Arc::new(CompatibleBackend::with_default_sensors(1));
        let gate = Arc::new(|_token: u32, sensor_type: SensorType| sensor_type != SensorType::COLOR);
        let broker =
            Broker::with_gate(BrokerConfig::default(), vec![backend.clone() as Arc<dyn HalBackend>], gate).unwrap();
        let color = SensorIdentity::local(1, SensorType::COLOR);
        assert!(matches!(
            broker.enable_sensor(5, color, 100_000_000, 0),
            Err(BrokerError::PermissionDenied { .. })
        ));
        assert_eq!(backend.calls().enable_count(&color), 0);
        assert!(broker.subscribed_sensors(5).is_empty());
    }

    #[test]
    fn test_failed_hal_enable_leaves_no_record() {
        let (backend, broker) = broker();
        let sar = SensorIdentity::local(1, SensorType::SAR);
        backend.fail_operation("enable");
        assert!(matches!(
            broker.enable_sensor(3, sar, 100_000_000, 0),
            Err(BrokerError::BackendUnavailable(_))
        ));
        assert!(broker.best_activation(sar).is_none());

        backend.clear_failures();
        broker.enable_sensor(3, sar, 100_000_000, 0).unwrap();
        assert_eq!(backend.calls().enable_count(&sar), 1);
    }

    #[test]
    fn test_suspend_and_resume_through_broker() {
        let (backend, broker) = broker();
        let color = SensorIdentity::local(1, SensorType::COLOR);
        broker.enable_sensor(8, color, 200_000_000, 0).unwrap();

        broker.suspend_sensors(8).unwrap();
        assert!(broker.is_suspended(8));
        assert!(!backend.is_enabled(&color));
        assert!(broker.get_active_info_list(8).unwrap().is_empty());

        broker.resume_sensors(8).unwrap();
        assert!(backend.is_enabled(&color));
        let infos = broker.get_active_info_list(8).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].period_ns, 200_000_000);
        assert!(matches!(broker.resume_sensors(8), Err(BrokerError::ResumeFailed(8))));
    }

    #[test]
    fn test_active_info_listener_sees_enables() {
        let (_, broker) = broker();
        let rx = broker.enable_active_info_cb(50);
        let sar = SensorIdentity::local(1, SensorType::SAR);
        broker.enable_sensor(4, sar, 100_000_000, 0).unwrap();
        let info = rx.try_recv().unwrap();
        assert_eq!(info.pid, 4);
        assert_eq!(info.sensor, sar);

        assert!(broker.disable_active_info_cb(50));
        assert!(!broker.disable_active_info_cb(50));
    }

    #[test]
    fn test_plug_events_update_catalog() {
        let (backend, broker) = broker();
        let rx = broker.subscribe_plug_events(11);
        let remote = SensorIdentity::new(7, SensorType::ACCELEROMETER, 0, sensor_hal::Locality::Remote);

        backend.attach(SensorDescriptor::new(remote, "band_acc", "vendor"), "band");
        assert_eq!(broker.sensor_list().len(), 5);
        let event = rx.try_recv().unwrap();
        assert!(event.is_online());
        assert_eq!(event.sensor, remote);

        backend.detach(remote, "band");
        assert_eq!(broker.sensor_list().len(), 4);
        assert!(!rx.try_recv().unwrap().is_online());
        assert!(broker.unsubscribe_plug_events(11));
    }

    #[test]
    fn test_dump_renders_json() {
        let (_, broker) = broker();
        broker.set_device_status(3);
        broker
            .enable_sensor(2, SensorIdentity::local(1, SensorType::SAR), 100_000_000, 0)
            .unwrap();
        let dump = broker.dump();
        assert_eq!(dump.backend, "compatible");
        assert_eq!(dump.channels.len(), 1);
        assert_eq!(dump.device_status, 3);
        let json = broker.dump_json().unwrap();
        assert!(json.contains("\"device_status\": 3"));
    }

    #[test]
    fn test_joining_subscriber_gets_only_event_driven_replay() {
        let (_, broker) = broker();
        let sar = SensorIdentity::local(1, SensorType::SAR);
        broker.enable_sensor(1, sar, 100_000_000, 0).unwrap();

        let on_change = HalEvent::new(sar, 5, vec![0; 4]).with_mode(ReportingMode::OnChange);
        broker.shared.store.record_last_event(sar, EventFrame::from_hal_event(&on_change));
        let replay = broker.enable_locked(2, sar, 100_000_000, 0).unwrap();
        assert_eq!(replay.map(|frame| frame.timestamp), Some(5));

        let periodic = HalEvent::new(sar, 6, vec![0; 4]);
        broker.shared.store.record_last_event(sar, EventFrame::from_hal_event(&periodic));
        assert!(broker.enable_locked(3, sar, 100_000_000, 0).unwrap().is_none());
        assert!(broker.shared.service_lock.try_lock().is_some());
    }

    #[test]
    fn test_failed_watch_leaves_channel_unbound() {
        let (_, broker) = broker();
        let client_loop = ReadinessLoop::start("client-8").unwrap();
        let on_frame: FrameCallback = Arc::new(|_| {});
        let transport = sensor_channel::Transport::create(&client_loop, on_frame).unwrap();
        let endpoint = transport.take_send_endpoint().unwrap();
        broker.shutdown();

        assert!(matches!(
            broker.transfer_data_channel(ClientRegistration::new(8, 1008, 8), endpoint),
            Err(BrokerError::ChannelError(sensor_channel::ChannelError::LoopStopped))
        ));
        assert!(!broker.has_channel(8));
        assert_eq!(broker.channel_count(), 0);
        client_loop.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (backend, broker) = broker();
        let sar = SensorIdentity::local(1, SensorType::SAR);
        broker.enable_sensor(2, sar, 100_000_000, 0).unwrap();
        broker.shutdown();
        broker.shutdown();
        assert!(broker.is_shut_down());
        assert!(!backend.is_enabled(&sar));
    }
}
