//! Backend selection and the broker's single HAL binding
//!
//! # Overview
//!
//! [`HalConnection::probe`] tries candidate backends in order and keeps the
//! first one that connects and enumerates. The broker only ever talks to the
//! resulting `HalConnection`, so it cannot tell which backend is active.
//!
//! The connection also owns the binding state: whether it is connected and
//! whether the data callback has been registered. The callback may be
//! registered exactly once; registering again without `unregister` fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{DataCallback, HalBackend, PlugCallback};
use crate::error::{HalError, Result};
use crate::sensor::{SensorDescriptor, SensorIdentity, SensorPlugInfo};

/// The selected backend plus its cached enumeration
pub struct HalConnection {
    backend: Arc<dyn HalBackend>,
    sensors: RwLock<Vec<SensorDescriptor>>,
    connected: AtomicBool,
    callback_registered: AtomicBool,
}

impl HalConnection {
    /// Connect to the first candidate that connects and enumerates successfully
    pub fn probe(candidates: Vec<Arc<dyn HalBackend>>) -> Result<Self> {
        let tried = candidates.len();
        for backend in candidates {
            if let Err(e) = backend.connect() {
                tracing::warn!("HAL backend {} failed to connect: {}", backend.name(), e);
                continue;
            }
            match backend.list_sensors() {
                Ok(sensors) => {
                    tracing::info!(
                        "Using HAL backend {} with {} sensors",
                        backend.name(),
                        sensors.len()
                    );
                    return Ok(Self {
                        backend,
                        sensors: RwLock::new(sensors),
                        connected: AtomicBool::new(true),
                        callback_registered: AtomicBool::new(false),
                    });
                }
                Err(e) => {
                    tracing::warn!("HAL backend {} failed to enumerate: {}", backend.name(), e);
                    if let Err(e) = backend.destroy() {
                        tracing::debug!("Destroying rejected backend {} failed: {}", backend.name(), e);
                    }
                }
            }
        }
        tracing::error!("No HAL backend could be connected");
        Err(HalError::NoBackendAvailable { tried })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_callback_registered(&self) -> bool {
        self.callback_registered.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(HalError::NotConnected)
        }
    }

    /// Cached sensor list, refreshed from the backend when empty
    pub fn list_sensors(&self) -> Result<Vec<SensorDescriptor>> {
        self.ensure_connected()?;
        {
            let cached = self.sensors.read();
            if !cached.is_empty() {
                return Ok(cached.clone());
            }
        }
        let fresh = self.backend.list_sensors()?;
        *self.sensors.write() = fresh.clone();
        Ok(fresh)
    }

    /// Re-enumerate one device and merge its sensors into the cache
    pub fn list_sensors_by_device(&self, device_id: i32) -> Result<Vec<SensorDescriptor>> {
        self.ensure_connected()?;
        let found = self.backend.list_sensors_by_device(device_id)?;
        let mut cached = self.sensors.write();
        for descriptor in &found {
            if !cached.iter().any(|s| s.identity == descriptor.identity) {
                cached.push(descriptor.clone());
            }
        }
        Ok(found)
    }

    /// Forget a detached sensor; returns whether it was cached
    pub fn erase_plugged_sensor(&self, info: &SensorPlugInfo) -> bool {
        let mut cached = self.sensors.write();
        let before = cached.len();
        cached.retain(|s| s.identity != info.identity);
        cached.len() != before
    }

    pub fn enable(&self, sensor: &SensorIdentity) -> Result<()> {
        self.ensure_connected()?;
        tracing::debug!(sensor = %sensor, backend = self.backend.name(), "HAL enable");
        self.backend.enable(sensor)
    }

    pub fn disable(&self, sensor: &SensorIdentity) -> Result<()> {
        self.ensure_connected()?;
        tracing::debug!(sensor = %sensor, backend = self.backend.name(), "HAL disable");
        self.backend.disable(sensor)
    }

    pub fn set_batch(&self, sensor: &SensorIdentity, sampling_ns: i64, report_ns: i64) -> Result<()> {
        self.ensure_connected()?;
        tracing::debug!(sensor = %sensor, sampling_ns, report_ns, "HAL set_batch");
        self.backend.set_batch(sensor, sampling_ns, report_ns)
    }

    pub fn set_mode(&self, sensor: &SensorIdentity, mode: i32) -> Result<()> {
        self.ensure_connected()?;
        self.backend.set_mode(sensor, mode)
    }

    pub fn set_option(&self, sensor: &SensorIdentity, option: i32) -> Result<()> {
        self.ensure_connected()?;
        self.backend.set_option(sensor, option)
    }

    /// Register the single data callback
    pub fn register_callback(&self, callback: DataCallback) -> Result<()> {
        self.ensure_connected()?;
        if self
            .callback_registered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HalError::AlreadyRegistered);
        }
        if let Err(e) = self.backend.register_callback(callback) {
            self.callback_registered.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    pub fn register_plug_callback(&self, callback: PlugCallback) -> Result<()> {
        self.ensure_connected()?;
        self.backend.register_plug_callback(callback)
    }

    pub fn unregister(&self) -> Result<()> {
        if !self.callback_registered.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.unregister()
    }

    /// Unregister and release the backend; safe to call more than once
    pub fn destroy(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.unregister() {
            tracing::warn!("HAL unregister during destroy failed: {}", e);
        }
        self.sensors.write().clear();
        self.backend.destroy()
    }
}

impl std::fmt::Debug for HalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HalConnection")
            .field("backend", &self.backend.name())
            .field("connected", &self.is_connected())
            .field("callback_registered", &self.is_callback_registered())
            .finish()
    }
}
