//! Configuration types for the sensor broker
//!
//! This module defines the configuration that controls the broker's
//! buffering, subscription limits, client channel flow control and HAL
//! connection policy.

use std::time::Duration;

use sensor_channel::SendPolicy;
use sensor_hal::RemoteConfig;
use sensor_store::StoreLimits;

/// Configuration for the [`Broker`](crate::Broker)
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Blocks in the event batch pool
    /// Default: 64
    pub block_count: usize,

    /// Frames per batch block
    /// Default: 16
    pub block_capacity: usize,

    /// Drains remembered when deciding how many blocks to keep allocated
    /// Default: 5
    pub retention_history: usize,

    /// Subscriptions accepted per sensor
    /// Default: 200
    pub max_clients_per_sensor: usize,

    /// Largest accepted `delay / period` ratio for one subscription
    /// Default: 1000
    pub max_event_count: i64,

    /// Non-blocking write retries before frames wait in the backlog
    /// Default: 5
    pub send_retry_attempts: u32,

    /// Pause between write retries
    /// Default: 500 microseconds
    pub send_retry_interval: Duration,

    /// Frames a slow client may have waiting before the oldest are dropped
    /// Default: 256
    pub max_pending_frames: usize,

    /// Recent events kept per sensor for diagnostics
    /// Default: 10
    pub recent_event_capacity: usize,

    /// Connection attempts against the remote HAL
    /// Default: 25
    pub hal_connect_attempts: u32,

    /// Pause between remote HAL connection attempts
    /// Default: 200 milliseconds
    pub hal_connect_interval: Duration,

    /// Cap on enumerated sensors and on active-info lists
    /// Default: 256
    pub max_sensor_count: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            block_count: 64,
            block_capacity: 16,
            retention_history: 5,
            max_clients_per_sensor: 200,
            max_event_count: 1000,
            send_retry_attempts: 5,
            send_retry_interval: Duration::from_micros(500),
            max_pending_frames: 256,
            recent_event_capacity: 10,
            hal_connect_attempts: 25,
            hal_connect_interval: Duration::from_millis(200),
            max_sensor_count: 256,
        }
    }
}

impl BrokerConfig {
    /// Create a new BrokerConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a BrokerConfig that flushes small batches quickly
    pub fn low_latency() -> Self {
        Self {
            block_capacity: 4,
            send_retry_attempts: 2,
            send_retry_interval: Duration::from_micros(100),
            max_pending_frames: 64,
            ..Default::default()
        }
    }

    /// Create a BrokerConfig optimized for resource efficiency
    pub fn resource_efficient() -> Self {
        Self {
            block_count: 16,
            retention_history: 3,
            max_clients_per_sensor: 50,
            max_pending_frames: 128,
            recent_event_capacity: 4,
            max_sensor_count: 64,
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), crate::BrokerError> {
        if self.block_count == 0 || self.block_capacity == 0 {
            return Err(crate::BrokerError::Configuration(
                "Batch pool must have at least one block of at least one frame".to_string(),
            ));
        }

        if self.retention_history == 0 {
            return Err(crate::BrokerError::Configuration(
                "Retention history must be greater than 0".to_string(),
            ));
        }

        if self.max_clients_per_sensor == 0 {
            return Err(crate::BrokerError::Configuration(
                "Max clients per sensor must be greater than 0".to_string(),
            ));
        }

        if self.max_event_count <= 0 {
            return Err(crate::BrokerError::Configuration(
                "Max event count must be greater than 0".to_string(),
            ));
        }

        if self.max_pending_frames == 0 {
            return Err(crate::BrokerError::Configuration(
                "Max pending frames must be greater than 0".to_string(),
            ));
        }

        if self.max_sensor_count == 0 {
            return Err(crate::BrokerError::Configuration(
                "Max sensor count must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_block_geometry(mut self, count: usize, capacity: usize) -> Self {
        self.block_count = count;
        self.block_capacity = capacity;
        self
    }

    pub fn with_retention_history(mut self, drains: usize) -> Self {
        self.retention_history = drains;
        self
    }

    pub fn with_max_clients_per_sensor(mut self, max: usize) -> Self {
        self.max_clients_per_sensor = max;
        self
    }

    pub fn with_send_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.send_retry_attempts = attempts;
        self.send_retry_interval = interval;
        self
    }

    pub fn with_max_pending_frames(mut self, frames: usize) -> Self {
        self.max_pending_frames = frames;
        self
    }

    pub fn with_hal_connect(mut self, attempts: u32, interval: Duration) -> Self {
        self.hal_connect_attempts = attempts;
        self.hal_connect_interval = interval;
        self
    }

    pub(crate) fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_clients_per_sensor: self.max_clients_per_sensor,
            recent_event_capacity: self.recent_event_capacity,
        }
    }

    pub(crate) fn send_policy(&self) -> SendPolicy {
        SendPolicy {
            retry_attempts: self.send_retry_attempts,
            retry_interval: self.send_retry_interval,
            max_pending_frames: self.max_pending_frames,
        }
    }

    /// Connection policy for a [`RemoteBackend`](sensor_hal::RemoteBackend)
    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            connect_attempts: self.hal_connect_attempts,
            connect_interval: self.hal_connect_interval,
            max_sensor_count: self.max_sensor_count,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.block_count, 64);
        assert_eq!(config.max_event_count, 1000);
        assert_eq!(config.send_retry_interval, Duration::from_micros(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let invalid_config = BrokerConfig {
            block_capacity: 0,
            ..Default::default()
        };
        assert!(invalid_config.validate().is_err());

        let invalid_ratio = BrokerConfig {
            max_event_count: 0,
            ..Default::default()
        };
        assert!(invalid_ratio.validate().is_err());
    }

    #[test]
    fn test_config_presets() {
        let fast = BrokerConfig::low_latency();
        assert_eq!(fast.block_capacity, 4);
        assert!(fast.validate().is_ok());

        let efficient = BrokerConfig::resource_efficient();
        assert_eq!(efficient.block_count, 16);
        assert!(efficient.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = BrokerConfig::new()
            .with_block_geometry(8, 32)
            .with_retention_history(2)
            .with_max_clients_per_sensor(3)
            .with_send_retry(1, Duration::from_micros(50))
            .with_max_pending_frames(16)
            .with_hal_connect(2, Duration::from_millis(1));

        assert_eq!(config.block_count, 8);
        assert_eq!(config.block_capacity, 32);
        assert_eq!(config.send_policy().max_pending_frames, 16);
        assert_eq!(config.store_limits().max_clients_per_sensor, 3);
        assert_eq!(config.remote_config().connect_attempts, 2);
        assert!(config.validate().is_ok());
    }
}
