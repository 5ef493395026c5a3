//! In-process virtual sensors
//!
//! `CompatibleBackend` stands in for a hardware driver when none is present.
//! It enumerates a configurable set of virtual sensors, records every control
//! call it receives, and can emit synthetic readings for enabled sensors from
//! a generator thread. Tests drive it synchronously with [`CompatibleBackend::inject`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::backend::{DataCallback, HalBackend, PlugCallback};
use crate::error::{HalError, Result};
use crate::sensor::{
    HalEvent, Locality, PlugStatus, ReportingMode, SensorDescriptor, SensorIdentity,
    SensorPlugInfo, SensorType,
};

const BACKEND_NAME: &str = "compatible";
const MIN_SAMPLE_PERIOD_NS: i64 = 100_000_000;
const MAX_SAMPLE_PERIOD_NS: i64 = 1_000_000_000;
const DEFAULT_MAX_RANGE: f32 = 9999.0;
const DEFAULT_POWER: f32 = 20.0;
const DEFAULT_PRECISION: f32 = 0.000001;
const DEFAULT_VERSION: &str = "1.0.1";
const HEADPOSTURE_FIFO_COUNT: i32 = 5;
const DRIVER_FAILURE: i32 = -1;

/// Build the default set of virtual sensors for `device_id`
pub fn default_sensors(device_id: i32) -> Vec<SensorDescriptor> {
    [
        (SensorType::COLOR, "sensor_color", "default_color"),
        (SensorType::SAR, "sensor_sar", "default_sar"),
        (SensorType::HEADPOSTURE, "sensor_headPosture", "default_headPosture"),
        (SensorType::PROXIMITY1, "sensor_proximity1", "default_proximity1"),
    ]
    .into_iter()
    .map(|(sensor_type, name, vendor)| {
        let fifo = if sensor_type == SensorType::HEADPOSTURE {
            HEADPOSTURE_FIFO_COUNT
        } else {
            0
        };
        SensorDescriptor::new(SensorIdentity::new(device_id, sensor_type, 0, Locality::Local), name, vendor)
            .with_versions(DEFAULT_VERSION, DEFAULT_VERSION)
            .with_physics(DEFAULT_MAX_RANGE, DEFAULT_PRECISION, DEFAULT_POWER)
            .with_sample_period(MIN_SAMPLE_PERIOD_NS, MAX_SAMPLE_PERIOD_NS)
            .with_fifo_max_event_count(fifo)
    })
    .collect()
}

/// Control calls observed by the backend
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub enables: HashMap<SensorIdentity, usize>,
    pub disables: HashMap<SensorIdentity, usize>,
    pub batches: Vec<(SensorIdentity, i64, i64)>,
    pub modes: Vec<(SensorIdentity, i32)>,
    pub options: Vec<(SensorIdentity, i32)>,
}

impl CallLog {
    pub fn enable_count(&self, sensor: &SensorIdentity) -> usize {
        self.enables.get(sensor).copied().unwrap_or(0)
    }

    pub fn disable_count(&self, sensor: &SensorIdentity) -> usize {
        self.disables.get(sensor).copied().unwrap_or(0)
    }

    pub fn last_batch(&self, sensor: &SensorIdentity) -> Option<(i64, i64)> {
        self.batches
            .iter()
            .rev()
            .find(|(id, _, _)| id == sensor)
            .map(|(_, period, delay)| (*period, *delay))
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveSensor {
    period_ns: i64,
    next_due: Instant,
    sequence: u64,
}

#[derive(Default)]
struct State {
    connected: bool,
    sensors: Vec<SensorDescriptor>,
    configured: HashMap<SensorIdentity, (i64, i64)>,
    enabled: HashMap<SensorIdentity, ActiveSensor>,
}

struct Inner {
    state: Mutex<State>,
    callback: RwLock<Option<DataCallback>>,
    plug_callback: RwLock<Option<PlugCallback>>,
    failures: Mutex<HashSet<&'static str>>,
    calls: Mutex<CallLog>,
    started: Instant,
}

impl Inner {
    fn check(&self, op: &'static str) -> Result<()> {
        if self.failures.lock().contains(op) {
            return Err(HalError::driver(op, DRIVER_FAILURE));
        }
        Ok(())
    }

    fn require_known(&self, state: &State, sensor: &SensorIdentity) -> Result<()> {
        if !state.connected {
            return Err(HalError::NotConnected);
        }
        if !state.sensors.iter().any(|s| &s.identity == sensor) {
            return Err(HalError::UnknownSensor(*sensor));
        }
        Ok(())
    }

    fn deliver(&self, event: HalEvent) -> bool {
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    fn timestamp_ns(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    /// Advance every enabled sensor whose period has elapsed and build its reading
    fn collect_due(&self, now: Instant) -> Vec<HalEvent> {
        let timestamp = self.timestamp_ns();
        let mut state = self.state.lock();
        let mut due = Vec::new();
        for (identity, active) in state.enabled.iter_mut() {
            if now < active.next_due {
                continue;
            }
            active.sequence += 1;
            let period = Duration::from_nanos(active.period_ns.max(1) as u64);
            active.next_due = now + period;
            due.push(synthetic_event(*identity, timestamp, active.sequence));
        }
        due
    }
}

fn synthetic_event(identity: SensorIdentity, timestamp_ns: i64, sequence: u64) -> HalEvent {
    if identity.sensor_type == SensorType::PROXIMITY || identity.sensor_type == SensorType::PROXIMITY1 {
        let far = 5.0f32.to_ne_bytes().to_vec();
        return HalEvent::new(identity, timestamp_ns, far).with_mode(ReportingMode::OnChange);
    }
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&(sequence as f32).to_ne_bytes());
    data.extend_from_slice(&0f32.to_ne_bytes());
    data.extend_from_slice(&0f32.to_ne_bytes());
    HalEvent::new(identity, timestamp_ns, data)
}

struct Generator {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Virtual in-process sensor backend
pub struct CompatibleBackend {
    inner: Arc<Inner>,
    tick: Option<Duration>,
    generator: Mutex<Option<Generator>>,
}

impl CompatibleBackend {
    /// Backend exposing exactly `sensors`, without a generator thread
    pub fn new(sensors: Vec<SensorDescriptor>) -> Self {
        let state = State {
            sensors,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                callback: RwLock::new(None),
                plug_callback: RwLock::new(None),
                failures: Mutex::new(HashSet::new()),
                calls: Mutex::new(CallLog::default()),
                started: Instant::now(),
            }),
            tick: None,
            generator: Mutex::new(None),
        }
    }

    /// Backend exposing the default virtual sensors on `device_id`
    pub fn with_default_sensors(device_id: i32) -> Self {
        Self::new(default_sensors(device_id))
    }

    /// Emit synthetic readings for enabled sensors, checking every `tick`
    pub fn with_generator(mut self, tick: Duration) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Make every subsequent call to `op` fail with a driver error
    pub fn fail_operation(&self, op: &'static str) {
        self.inner.failures.lock().insert(op);
    }

    pub fn clear_failures(&self) {
        self.inner.failures.lock().clear();
    }

    /// Snapshot of the control calls seen so far
    pub fn calls(&self) -> CallLog {
        self.inner.calls.lock().clone()
    }

    pub fn is_enabled(&self, sensor: &SensorIdentity) -> bool {
        self.inner.state.lock().enabled.contains_key(sensor)
    }

    /// Deliver `event` to the registered callback on the calling thread
    ///
    /// Returns false when the sensor is not enabled or no callback is registered.
    pub fn inject(&self, event: HalEvent) -> bool {
        if !self.is_enabled(&event.identity) {
            tracing::debug!(sensor = %event.identity, "Dropping injected event for disabled sensor");
            return false;
        }
        self.inner.deliver(event)
    }

    /// Add a sensor at runtime and report it through the plug callback
    pub fn attach(&self, descriptor: SensorDescriptor, device_name: &str) {
        let info = SensorPlugInfo {
            identity: descriptor.identity,
            device_name: device_name.to_string(),
            status: PlugStatus::Online,
            reserved: 0,
        };
        {
            let mut state = self.inner.state.lock();
            state.sensors.retain(|s| s.identity != descriptor.identity);
            state.sensors.push(descriptor);
        }
        self.notify_plug(info);
    }

    /// Remove a sensor at runtime and report it through the plug callback
    pub fn detach(&self, identity: SensorIdentity, device_name: &str) {
        {
            let mut state = self.inner.state.lock();
            state.sensors.retain(|s| s.identity != identity);
            state.enabled.remove(&identity);
            state.configured.remove(&identity);
        }
        self.notify_plug(SensorPlugInfo {
            identity,
            device_name: device_name.to_string(),
            status: PlugStatus::Offline,
            reserved: 0,
        });
    }

    fn notify_plug(&self, info: SensorPlugInfo) {
        let callback = self.inner.plug_callback.read().clone();
        if let Some(callback) = callback {
            callback(info);
        }
    }

    fn start_generator(&self) {
        let Some(tick) = self.tick else {
            return;
        };
        let mut generator = self.generator.lock();
        if generator.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = channel::bounded(1);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("compatible-hal".to_string())
            .spawn(move || run_generator(inner, tick, shutdown_rx));
        match spawned {
            Ok(handle) => *generator = Some(Generator { shutdown, handle }),
            Err(e) => tracing::error!("Failed to spawn compatible generator thread: {}", e),
        }
    }

    fn stop_generator(&self) {
        let generator = self.generator.lock().take();
        if let Some(generator) = generator {
            let _ = generator.shutdown.send(());
            if generator.handle.join().is_err() {
                tracing::warn!("Compatible generator thread panicked");
            }
        }
    }
}

fn run_generator(inner: Arc<Inner>, tick: Duration, shutdown: Receiver<()>) {
    tracing::debug!("Compatible generator started, tick {:?}", tick);
    loop {
        match shutdown.recv_timeout(tick) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        for event in inner.collect_due(Instant::now()) {
            inner.deliver(event);
        }
    }
    tracing::debug!("Compatible generator stopped");
}

impl HalBackend for CompatibleBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn connect(&self) -> Result<()> {
        self.inner.check("connect")?;
        self.inner.state.lock().connected = true;
        self.start_generator();
        tracing::info!("Compatible HAL connected");
        Ok(())
    }

    fn list_sensors(&self) -> Result<Vec<SensorDescriptor>> {
        self.inner.check("list_sensors")?;
        let state = self.inner.state.lock();
        if !state.connected {
            return Err(HalError::NotConnected);
        }
        Ok(state.sensors.clone())
    }

    fn enable(&self, sensor: &SensorIdentity) -> Result<()> {
        self.inner.check("enable")?;
        {
            let mut state = self.inner.state.lock();
            self.inner.require_known(&state, sensor)?;
            let period_ns = match state.configured.get(sensor) {
                Some((period, _)) => *period,
                None => MIN_SAMPLE_PERIOD_NS,
            };
            state.enabled.insert(
                *sensor,
                ActiveSensor {
                    period_ns,
                    next_due: Instant::now(),
                    sequence: 0,
                },
            );
        }
        *self.inner.calls.lock().enables.entry(*sensor).or_insert(0) += 1;
        Ok(())
    }

    fn disable(&self, sensor: &SensorIdentity) -> Result<()> {
        self.inner.check("disable")?;
        {
            let mut state = self.inner.state.lock();
            self.inner.require_known(&state, sensor)?;
            state.enabled.remove(sensor);
        }
        *self.inner.calls.lock().disables.entry(*sensor).or_insert(0) += 1;
        Ok(())
    }

    fn set_batch(&self, sensor: &SensorIdentity, sampling_ns: i64, report_ns: i64) -> Result<()> {
        self.inner.check("set_batch")?;
        {
            let mut state = self.inner.state.lock();
            self.inner.require_known(&state, sensor)?;
            state.configured.insert(*sensor, (sampling_ns, report_ns));
            if let Some(active) = state.enabled.get_mut(sensor) {
                active.period_ns = sampling_ns;
            }
        }
        self.inner.calls.lock().batches.push((*sensor, sampling_ns, report_ns));
        Ok(())
    }

    fn set_mode(&self, sensor: &SensorIdentity, mode: i32) -> Result<()> {
        self.inner.check("set_mode")?;
        self.inner.require_known(&self.inner.state.lock(), sensor)?;
        self.inner.calls.lock().modes.push((*sensor, mode));
        Ok(())
    }

    fn set_option(&self, sensor: &SensorIdentity, option: i32) -> Result<()> {
        self.inner.check("set_option")?;
        self.inner.require_known(&self.inner.state.lock(), sensor)?;
        self.inner.calls.lock().options.push((*sensor, option));
        Ok(())
    }

    fn register_callback(&self, callback: DataCallback) -> Result<()> {
        self.inner.check("register_callback")?;
        *self.inner.callback.write() = Some(callback);
        Ok(())
    }

    fn register_plug_callback(&self, callback: PlugCallback) -> Result<()> {
        *self.inner.plug_callback.write() = Some(callback);
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        *self.inner.callback.write() = None;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.stop_generator();
        let mut state = self.inner.state.lock();
        state.connected = false;
        state.enabled.clear();
        state.configured.clear();
        *self.inner.callback.write() = None;
        *self.inner.plug_callback.write() = None;
        tracing::info!("Compatible HAL destroyed");
        Ok(())
    }
}

impl Drop for CompatibleBackend {
    fn drop(&mut self) {
        self.stop_generator();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connected() -> CompatibleBackend {
        let backend = CompatibleBackend::with_default_sensors(1);
        backend.connect().unwrap();
        backend
    }

    #[test]
    fn test_default_sensor_set() {
        let backend = connected();
        let sensors = backend.list_sensors().unwrap();
        assert_eq!(sensors.len(), 4);
        assert!(sensors.iter().all(|s| s.min_sample_period_ns == MIN_SAMPLE_PERIOD_NS));
        let posture = sensors
            .iter()
            .find(|s| s.sensor_type() == SensorType::HEADPOSTURE)
            .unwrap();
        assert_eq!(posture.fifo_max_event_count, HEADPOSTURE_FIFO_COUNT);
    }

    #[test]
    fn test_list_requires_connect() {
        let backend = CompatibleBackend::with_default_sensors(1);
        assert!(matches!(backend.list_sensors(), Err(HalError::NotConnected)));
    }

    #[test]
    fn test_enable_unknown_sensor() {
        let backend = connected();
        let unknown = SensorIdentity::local(1, SensorType::HEART_RATE);
        assert!(matches!(backend.enable(&unknown), Err(HalError::UnknownSensor(_))));
    }

    #[test]
    fn test_call_log_counts() {
        let backend = connected();
        let sar = SensorIdentity::local(1, SensorType::SAR);
        backend.set_batch(&sar, 200_000_000, 0).unwrap();
        backend.enable(&sar).unwrap();
        backend.disable(&sar).unwrap();

        let calls = backend.calls();
        assert_eq!(calls.enable_count(&sar), 1);
        assert_eq!(calls.disable_count(&sar), 1);
        assert_eq!(calls.last_batch(&sar), Some((200_000_000, 0)));
    }

    #[test]
    fn test_failure_injection() {
        let backend = connected();
        let sar = SensorIdentity::local(1, SensorType::SAR);
        backend.fail_operation("enable");
        assert!(matches!(
            backend.enable(&sar),
            Err(HalError::Driver { op: "enable", .. })
        ));
        backend.clear_failures();
        assert!(backend.enable(&sar).is_ok());
    }

    #[test]
    fn test_inject_requires_enabled_sensor() {
        let backend = connected();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        backend
            .register_callback(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let sar = SensorIdentity::local(1, SensorType::SAR);
        assert!(!backend.inject(HalEvent::new(sar, 1, vec![1])));
        backend.enable(&sar).unwrap();
        assert!(backend.inject(HalEvent::new(sar, 2, vec![1])));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_generator_emits_for_enabled_sensor() {
        let backend = CompatibleBackend::with_default_sensors(1).with_generator(Duration::from_millis(5));
        backend.connect().unwrap();
        let (tx, rx) = channel::unbounded();
        backend
            .register_callback(Arc::new(move |event| {
                let _ = tx.send(event);
            }))
            .unwrap();
        let color = SensorIdentity::local(1, SensorType::COLOR);
        backend.enable(&color).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.identity, color);
        assert_eq!(event.data.len(), 12);
        backend.destroy().unwrap();
    }

    #[test]
    fn test_attach_and_detach_notify_plug_callback() {
        let backend = connected();
        let (tx, rx) = channel::unbounded();
        backend
            .register_plug_callback(Arc::new(move |info| {
                let _ = tx.send(info);
            }))
            .unwrap();

        let id = SensorIdentity::new(9, SensorType::ACCELEROMETER, 0, Locality::Remote);
        backend.attach(SensorDescriptor::new(id, "ext_acc", "ext"), "watch");
        assert_eq!(backend.list_sensors_by_device(9).unwrap().len(), 1);
        assert_eq!(rx.try_recv().unwrap().status, PlugStatus::Online);

        backend.detach(id, "watch");
        assert!(backend.list_sensors_by_device(9).unwrap().is_empty());
        assert_eq!(rx.try_recv().unwrap().status, PlugStatus::Offline);
    }
}
