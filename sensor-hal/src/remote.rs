//! Versioned remote HAL proxy backend
//!
//! The vendor HAL runs as a separate service reached through a generated
//! interface client. [`RemoteHal`] is that client's surface: status-code
//! returning calls and raw event records. [`RemoteBackend`] adapts it to
//! [`HalBackend`]: it retries the connection, rejects interface versions that
//! are too old, caps enumeration, and normalizes raw records into [`HalEvent`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::backend::{DataCallback, HalBackend, PlugCallback};
use crate::error::{HalError, Result};
use crate::sensor::{
    HalEvent, Locality, ReportingMode, SensorDescriptor, SensorIdentity, SensorPlugInfo, SensorType,
};

const BACKEND_NAME: &str = "remote";
const STATUS_OK: i32 = 0;

/// Raw event record as produced by the remote HAL
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub device_id: i32,
    pub sensor_type: i32,
    pub sensor_index: i32,
    pub location: i32,
    pub version: i32,
    pub timestamp: i64,
    pub option: u32,
    pub mode: i32,
    pub data: Vec<u8>,
}

/// Raw callback signature expected by the remote HAL
pub type RemoteEventCallback = Arc<dyn Fn(RemoteEvent) + Send + Sync>;

/// Raw hot-plug callback signature expected by the remote HAL
pub type RemotePlugCallback = Arc<dyn Fn(SensorPlugInfo) + Send + Sync>;

/// Generated client of the remote HAL service
#[cfg_attr(test, mockall::automock)]
pub trait RemoteHal: Send + Sync {
    fn interface_version(&self) -> u32;
    fn get_all_sensor_info(&self) -> std::result::Result<Vec<SensorDescriptor>, i32>;
    fn enable(&self, sensor: &SensorIdentity) -> i32;
    fn disable(&self, sensor: &SensorIdentity) -> i32;
    fn set_batch(&self, sensor: &SensorIdentity, sampling_ns: i64, report_ns: i64) -> i32;
    fn set_mode(&self, sensor: &SensorIdentity, mode: i32) -> i32;
    fn set_option(&self, sensor: &SensorIdentity, option: i32) -> i32;
    fn register(&self, callback: RemoteEventCallback) -> i32;
    fn register_plug(&self, callback: RemotePlugCallback) -> i32;
    fn unregister(&self) -> i32;
}

/// Resolves the remote HAL service; `None` while the service is not up
pub type RemoteConnector = Box<dyn Fn() -> Option<Arc<dyn RemoteHal>> + Send + Sync>;

/// Connection policy for [`RemoteBackend`]
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Default: 25
    pub connect_attempts: u32,
    /// Default: 200ms
    pub connect_interval: Duration,
    /// Oldest interface version accepted. Default: 1
    pub min_interface_version: u32,
    /// Default: 256
    pub max_sensor_count: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 25,
            connect_interval: Duration::from_millis(200),
            min_interface_version: 1,
            max_sensor_count: 256,
        }
    }
}

/// [`HalBackend`] over a [`RemoteHal`] proxy
pub struct RemoteBackend {
    connector: RemoteConnector,
    config: RemoteConfig,
    proxy: RwLock<Option<Arc<dyn RemoteHal>>>,
}

impl RemoteBackend {
    pub fn new(connector: RemoteConnector, config: RemoteConfig) -> Self {
        Self {
            connector,
            config,
            proxy: RwLock::new(None),
        }
    }

    fn proxy(&self) -> Result<Arc<dyn RemoteHal>> {
        self.proxy.read().clone().ok_or(HalError::NotConnected)
    }

    fn status(op: &'static str, code: i32) -> Result<()> {
        if code == STATUS_OK {
            Ok(())
        } else {
            tracing::error!("Remote HAL {} failed with code {}", op, code);
            Err(HalError::driver(op, code))
        }
    }
}

/// Normalize a raw remote record into a [`HalEvent`]
///
/// Proximity readings are always reported as on-change.
pub fn normalize_event(raw: RemoteEvent) -> HalEvent {
    let sensor_type = SensorType(raw.sensor_type);
    let mode = if sensor_type == SensorType::PROXIMITY {
        ReportingMode::OnChange.as_raw()
    } else {
        raw.mode
    };
    HalEvent {
        identity: SensorIdentity::new(
            raw.device_id,
            sensor_type,
            raw.sensor_index,
            Locality::from_raw(raw.location),
        ),
        version: raw.version,
        timestamp_ns: raw.timestamp,
        option: raw.option,
        mode,
        data: raw.data,
    }
}

impl HalBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn connect(&self) -> Result<()> {
        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(proxy) = (self.connector)() {
                let version = proxy.interface_version();
                if version < self.config.min_interface_version {
                    return Err(HalError::VersionMismatch {
                        found: version,
                        required: self.config.min_interface_version,
                    });
                }
                tracing::info!("Remote HAL connected (interface v{}, attempt {})", version, attempt);
                *self.proxy.write() = Some(proxy);
                return Ok(());
            }
            tracing::debug!("Remote HAL not available, attempt {}/{}", attempt, attempts);
            if attempt < attempts {
                thread::sleep(self.config.connect_interval);
            }
        }
        Err(HalError::ConnectFailed {
            backend: BACKEND_NAME,
            reason: format!("service unavailable after {attempts} attempts"),
        })
    }

    fn list_sensors(&self) -> Result<Vec<SensorDescriptor>> {
        let mut sensors = self
            .proxy()?
            .get_all_sensor_info()
            .map_err(|code| HalError::driver("get_all_sensor_info", code))?;
        if sensors.len() > self.config.max_sensor_count {
            tracing::warn!(
                "Remote HAL reported {} sensors, keeping {}",
                sensors.len(),
                self.config.max_sensor_count
            );
            sensors.truncate(self.config.max_sensor_count);
        }
        Ok(sensors)
    }

    fn enable(&self, sensor: &SensorIdentity) -> Result<()> {
        Self::status("enable", self.proxy()?.enable(sensor))
    }

    fn disable(&self, sensor: &SensorIdentity) -> Result<()> {
        Self::status("disable", self.proxy()?.disable(sensor))
    }

    fn set_batch(&self, sensor: &SensorIdentity, sampling_ns: i64, report_ns: i64) -> Result<()> {
        Self::status("set_batch", self.proxy()?.set_batch(sensor, sampling_ns, report_ns))
    }

    fn set_mode(&self, sensor: &SensorIdentity, mode: i32) -> Result<()> {
        Self::status("set_mode", self.proxy()?.set_mode(sensor, mode))
    }

    fn set_option(&self, sensor: &SensorIdentity, option: i32) -> Result<()> {
        Self::status("set_option", self.proxy()?.set_option(sensor, option))
    }

    fn register_callback(&self, callback: DataCallback) -> Result<()> {
        let raw: RemoteEventCallback = Arc::new(move |event| callback(normalize_event(event)));
        Self::status("register", self.proxy()?.register(raw))
    }

    fn register_plug_callback(&self, callback: PlugCallback) -> Result<()> {
        let raw: RemotePlugCallback = Arc::new(move |info| callback(info));
        Self::status("register_plug", self.proxy()?.register_plug(raw))
    }

    fn unregister(&self) -> Result<()> {
        Self::status("unregister", self.proxy()?.unregister())
    }

    fn destroy(&self) -> Result<()> {
        if let Some(proxy) = self.proxy.write().take() {
            let code = proxy.unregister();
            if code != STATUS_OK {
                tracing::warn!("Remote HAL unregister during destroy returned {}", code);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RemoteConfig {
        RemoteConfig {
            connect_attempts: 3,
            connect_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn backend_with(mock: MockRemoteHal) -> RemoteBackend {
        let proxy: Arc<dyn RemoteHal> = Arc::new(mock);
        RemoteBackend::new(Box::new(move || Some(Arc::clone(&proxy))), fast_config())
    }

    #[test]
    fn test_connect_gives_up_after_attempts() {
        let tries = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&tries);
        let backend = RemoteBackend::new(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            fast_config(),
        );
        assert!(matches!(backend.connect(), Err(HalError::ConnectFailed { .. })));
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_connect_rejects_old_interface() {
        let mut mock = MockRemoteHal::new();
        mock.expect_interface_version().return_const(1u32);
        let proxy: Arc<dyn RemoteHal> = Arc::new(mock);
        let backend = RemoteBackend::new(
            Box::new(move || Some(Arc::clone(&proxy))),
            RemoteConfig {
                min_interface_version: 2,
                ..fast_config()
            },
        );
        assert!(matches!(
            backend.connect(),
            Err(HalError::VersionMismatch { found: 1, required: 2 })
        ));
    }

    #[test]
    fn test_calls_before_connect_fail() {
        let backend = backend_with(MockRemoteHal::new());
        let id = SensorIdentity::local(0, SensorType::ACCELEROMETER);
        assert!(matches!(backend.enable(&id), Err(HalError::NotConnected)));
    }

    #[test]
    fn test_status_codes_map_to_driver_errors() {
        let mut mock = MockRemoteHal::new();
        mock.expect_interface_version().return_const(3u32);
        mock.expect_enable().return_const(-23);
        mock.expect_disable().return_const(0);
        let backend = backend_with(mock);
        backend.connect().unwrap();

        let id = SensorIdentity::local(0, SensorType::ACCELEROMETER);
        assert!(matches!(
            backend.enable(&id),
            Err(HalError::Driver { op: "enable", code: -23 })
        ));
        assert!(backend.disable(&id).is_ok());
    }

    #[test]
    fn test_sensor_list_is_capped() {
        let mut mock = MockRemoteHal::new();
        mock.expect_interface_version().return_const(1u32);
        mock.expect_get_all_sensor_info().returning(|| {
            Ok((0..10)
                .map(|i| {
                    SensorDescriptor::new(
                        SensorIdentity::new(0, SensorType::ACCELEROMETER, i, Locality::Local),
                        "acc",
                        "vendor",
                    )
                })
                .collect())
        });
        let proxy: Arc<dyn RemoteHal> = Arc::new(mock);
        let backend = RemoteBackend::new(
            Box::new(move || Some(Arc::clone(&proxy))),
            RemoteConfig {
                max_sensor_count: 4,
                ..fast_config()
            },
        );
        backend.connect().unwrap();
        assert_eq!(backend.list_sensors().unwrap().len(), 4);
    }

    #[test]
    fn test_normalize_forces_proximity_on_change() {
        let raw = RemoteEvent {
            device_id: 1,
            sensor_type: SensorType::PROXIMITY.as_raw(),
            sensor_index: 0,
            location: 1,
            version: 2,
            timestamp: 99,
            option: 0,
            mode: ReportingMode::Realtime.as_raw(),
            data: vec![0; 4],
        };
        let event = normalize_event(raw);
        assert_eq!(event.mode, ReportingMode::OnChange.as_raw());
        assert_eq!(event.identity.locality, Locality::Local);
        assert_eq!(event.timestamp_ns, 99);
    }
}
