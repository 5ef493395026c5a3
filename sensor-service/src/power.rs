//! Suspending and resuming the sensors of a backgrounded client

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sensor_hal::{HalConnection, SensorIdentity, SensorType};

use crate::client::ClientStore;
use crate::error::{BrokerError, Result};
use crate::manager::RateManager;
use crate::plug::ActiveInfo;

/// Rate a client had when its sensors were suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspendedRate {
    pub period_ns: i64,
    pub delay_ns: i64,
}

/// Step counters keep running while their owner is suspended
pub fn is_suspend_exempt(sensor_type: SensorType) -> bool {
    sensor_type == SensorType::PEDOMETER_DETECTION || sensor_type == SensorType::PEDOMETER
}

#[derive(Debug)]
pub struct PowerPolicy {
    rates: Arc<RateManager>,
    hal: Arc<HalConnection>,
    store: Arc<ClientStore>,
    suspended: Mutex<HashMap<i32, HashMap<SensorIdentity, SuspendedRate>>>,
    max_sensor_count: usize,
    max_event_count: i64,
}

impl PowerPolicy {
    pub fn new(
        rates: Arc<RateManager>,
        hal: Arc<HalConnection>,
        store: Arc<ClientStore>,
        max_sensor_count: usize,
        max_event_count: i64,
    ) -> Self {
        Self {
            rates,
            hal,
            store,
            suspended: Mutex::new(HashMap::new()),
            max_sensor_count,
            max_event_count,
        }
    }

    /// Stop every sensor of `pid`, remembering its rates for [`resume`](Self::resume)
    ///
    /// Sensors other clients still use keep running; only `pid`'s record goes.
    /// Returns the sensors whose hardware was stopped.
    pub fn suspend(&self, pid: i32) -> Result<Vec<SensorIdentity>> {
        let sensors = self.store.sensor_ids_for(pid);
        if sensors.is_empty() {
            tracing::debug!(pid, "Nothing to suspend");
            return Err(BrokerError::SuspendFailed(pid));
        }

        let mut suspended = self.suspended.lock();
        let mut saved = suspended.remove(&pid).unwrap_or_default();
        let mut stopped = Vec::new();
        let mut all_suspended = true;
        for sensor in sensors {
            if is_suspend_exempt(sensor.sensor_type) {
                continue;
            }
            let Some(record) = self.store.current_record(sensor, pid) else {
                continue;
            };
            let rate = SuspendedRate {
                period_ns: record.period_ns,
                delay_ns: record.delay_ns,
            };
            if self.rates.is_other_client_using(sensor, pid) {
                saved.insert(sensor, rate);
                continue;
            }
            if let Err(e) = self.hal.disable(&sensor) {
                tracing::error!(%sensor, pid, "Disabling sensor for suspend failed: {}", e);
                all_suspended = false;
                continue;
            }
            saved.insert(sensor, rate);
            self.rates.after_disable(sensor);
            stopped.push(sensor);
        }
        if !saved.is_empty() {
            suspended.insert(pid, saved);
        }

        if !all_suspended {
            return Err(BrokerError::SuspendFailed(pid));
        }
        tracing::info!(pid, stopped = stopped.len(), "Sensors suspended");
        Ok(stopped)
    }

    /// Restore the rates saved by [`suspend`](Self::suspend)
    ///
    /// Sensors that cannot be restored stay remembered for a later attempt.
    pub fn resume(&self, pid: i32) -> Result<()> {
        let mut suspended = self.suspended.lock();
        let Some(saved) = suspended.remove(&pid) else {
            tracing::debug!(pid, "Resume without a prior suspend");
            return Err(BrokerError::ResumeFailed(pid));
        };

        let failed: HashMap<SensorIdentity, SuspendedRate> = saved
            .into_iter()
            .filter(|(sensor, rate)| !self.resume_one(pid, *sensor, *rate))
            .collect();
        if failed.is_empty() {
            tracing::info!(pid, "Sensors resumed");
            return Ok(());
        }
        tracing::error!(pid, failed = failed.len(), "Some sensors could not be resumed");
        suspended.insert(pid, failed);
        Err(BrokerError::ResumeFailed(pid))
    }

    fn resume_one(&self, pid: i32, sensor: SensorIdentity, rate: SuspendedRate) -> bool {
        if !sensor.sensor_type.is_valid()
            || rate.period_ns <= 0
            || rate.delay_ns / rate.period_ns > self.max_event_count
        {
            tracing::error!(%sensor, pid, "Saved rate is not resumable");
            return false;
        }
        let running = self.store.sensor_state(sensor);
        if !self.rates.save_subscriber(sensor, pid, rate.period_ns, rate.delay_ns) {
            return false;
        }
        if let Err(e) = self.rates.set_best_params(sensor, rate.period_ns, rate.delay_ns) {
            tracing::error!(%sensor, pid, "Restoring rate failed: {}", e);
            self.store.remove_subscription(sensor, pid);
            return false;
        }
        if running {
            return true;
        }
        if let Err(e) = self.hal.enable(&sensor) {
            tracing::error!(%sensor, pid, "Re-enabling sensor failed: {}", e);
            self.store.remove_subscription(sensor, pid);
            return false;
        }
        true
    }

    /// Resume every suspended client
    pub fn reset(&self) -> Result<()> {
        let failed = self
            .suspended_pids()
            .into_iter()
            .filter(|pid| self.resume(*pid).is_err())
            .count();
        if failed > 0 {
            return Err(BrokerError::ResetFailed(failed));
        }
        Ok(())
    }

    pub fn suspended_pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.suspended.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn is_suspended(&self, pid: i32) -> bool {
        self.suspended.lock().contains_key(&pid)
    }

    /// Drop saved rates of a process that went away
    pub fn forget(&self, pid: i32) -> bool {
        self.suspended.lock().remove(&pid).is_some()
    }

    /// Current subscriptions of `pid`
    pub fn active_info_list(&self, pid: i32) -> Vec<ActiveInfo> {
        let mut list: Vec<ActiveInfo> = self
            .store
            .sensor_ids_for(pid)
            .into_iter()
            .filter_map(|sensor| {
                self.store.current_record(sensor, pid).map(|record| ActiveInfo {
                    pid,
                    sensor,
                    period_ns: record.period_ns,
                    delay_ns: record.delay_ns,
                })
            })
            .collect();
        list.sort_by_key(|info| (info.sensor.device_id, info.sensor.sensor_type.as_raw(), info.sensor.sensor_index));
        list.truncate(self.max_sensor_count);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SensorCatalog;
    use sensor_hal::{CompatibleBackend, HalBackend, SensorDescriptor};

    struct Fixture {
        backend: Arc<CompatibleBackend>,
        store: Arc<ClientStore>,
        power: PowerPolicy,
    }

    fn descriptor(sensor_type: SensorType) -> SensorDescriptor {
        SensorDescriptor::new(SensorIdentity::local(0, sensor_type), "sensor", "vendor")
            .with_sample_period(1_000_000, 1_000_000_000)
    }

    fn fixture() -> Fixture {
        let descriptors = vec![
            descriptor(SensorType::ACCELEROMETER),
            descriptor(SensorType::GYROSCOPE),
            descriptor(SensorType::PEDOMETER),
        ];
        let backend = Arc::new(CompatibleBackend::new(descriptors.clone()));
        let hal = Arc::new(HalConnection::probe(vec![backend.clone() as Arc<dyn HalBackend>]).unwrap());
        let catalog = Arc::new(SensorCatalog::new(16));
        catalog.load(descriptors);
        let store = Arc::new(ClientStore::default());
        let rates = Arc::new(RateManager::new(Arc::clone(&hal), Arc::clone(&store), catalog));
        let power = PowerPolicy::new(rates, hal, Arc::clone(&store), 16, 1000);
        Fixture { backend, store, power }
    }

    fn enable(f: &Fixture, sensor: SensorIdentity, pid: i32, period_ns: i64) {
        f.store.update_subscription(sensor, pid, period_ns, 0);
        f.backend.enable(&sensor).unwrap();
    }

    #[test]
    fn test_suspend_without_sensors_fails() {
        let f = fixture();
        assert!(matches!(f.power.suspend(9), Err(BrokerError::SuspendFailed(9))));
        assert!(matches!(f.power.resume(9), Err(BrokerError::ResumeFailed(9))));
    }

    #[test]
    fn test_suspend_and_resume_round_trip() {
        let f = fixture();
        let accel = SensorIdentity::local(0, SensorType::ACCELEROMETER);
        let steps = SensorIdentity::local(0, SensorType::PEDOMETER);
        enable(&f, accel, 1, 10_000_000);
        enable(&f, steps, 1, 100_000_000);

        let stopped = f.power.suspend(1).unwrap();
        assert_eq!(stopped, vec![accel]);
        assert!(!f.backend.is_enabled(&accel));
        assert!(f.backend.is_enabled(&steps));
        assert!(f.power.is_suspended(1));
        assert!(f.store.current_record(accel, 1).is_none());

        f.power.resume(1).unwrap();
        assert!(f.backend.is_enabled(&accel));
        assert_eq!(f.store.current_record(accel, 1).map(|r| r.period_ns), Some(10_000_000));
        assert!(!f.power.is_suspended(1));
    }

    #[test]
    fn test_shared_sensor_keeps_running() {
        let f = fixture();
        let gyro = SensorIdentity::local(0, SensorType::GYROSCOPE);
        enable(&f, gyro, 1, 10_000_000);
        f.store.update_subscription(gyro, 2, 20_000_000, 0);

        assert!(f.power.suspend(1).unwrap().is_empty());
        assert!(f.backend.is_enabled(&gyro));
        assert_eq!(f.backend.calls().last_batch(&gyro), Some((20_000_000, 0)));

        f.power.resume(1).unwrap();
        assert_eq!(f.backend.calls().enable_count(&gyro), 1);
        assert_eq!(f.store.best_activation(gyro).period_ns, 10_000_000);
    }

    #[test]
    fn test_failed_resume_is_retried_by_reset() {
        let f = fixture();
        let accel = SensorIdentity::local(0, SensorType::ACCELEROMETER);
        enable(&f, accel, 1, 10_000_000);
        f.power.suspend(1).unwrap();

        f.backend.fail_operation("enable");
        assert!(matches!(f.power.resume(1), Err(BrokerError::ResumeFailed(1))));
        assert_eq!(f.power.suspended_pids(), vec![1]);
        assert!(matches!(f.power.reset(), Err(BrokerError::ResetFailed(1))));

        f.backend.clear_failures();
        f.power.reset().unwrap();
        assert!(f.power.suspended_pids().is_empty());
        assert!(f.backend.is_enabled(&accel));
    }

    #[test]
    fn test_suspend_of_exempt_sensors_only_is_not_remembered() {
        let f = fixture();
        let steps = SensorIdentity::local(0, SensorType::PEDOMETER);
        enable(&f, steps, 3, 100_000_000);

        assert!(f.power.suspend(3).unwrap().is_empty());
        assert!(f.backend.is_enabled(&steps));
        assert!(!f.power.is_suspended(3));
        assert!(f.power.suspended_pids().is_empty());
    }

    #[test]
    fn test_failed_disable_keeps_sensor_owned() {
        let f = fixture();
        let accel = SensorIdentity::local(0, SensorType::ACCELEROMETER);
        let gyro = SensorIdentity::local(0, SensorType::GYROSCOPE);
        enable(&f, accel, 1, 10_000_000);
        f.backend.fail_operation("disable");

        assert!(matches!(f.power.suspend(1), Err(BrokerError::SuspendFailed(1))));
        assert!(f.backend.is_enabled(&accel));
        assert_eq!(f.store.current_record(accel, 1).map(|r| r.period_ns), Some(10_000_000));
        assert!(!f.power.is_suspended(1));

        f.backend.clear_failures();
        enable(&f, gyro, 1, 20_000_000);
        f.power.suspend(1).unwrap();
        assert!(f.power.is_suspended(1));
        assert!(!f.backend.is_enabled(&accel));
        assert!(!f.backend.is_enabled(&gyro));
    }

    #[test]
    fn test_active_info_list_is_capped() {
        let f = fixture();
        for sensor_type in [SensorType::ACCELEROMETER, SensorType::GYROSCOPE, SensorType::PEDOMETER] {
            f.store.update_subscription(SensorIdentity::local(0, sensor_type), 4, 10_000_000, 0);
        }
        let list = f.power.active_info_list(4);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].sensor.sensor_type, SensorType::ACCELEROMETER);

        let capped = PowerPolicy {
            max_sensor_count: 2,
            ..f.power
        };
        assert_eq!(capped.active_info_list(4).len(), 2);
    }
}
