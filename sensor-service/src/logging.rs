//! Logging setup for processes embedding the sensor broker
//!
//! Library code only emits `tracing` events. Binaries call one of the
//! functions here once at startup to install a subscriber.
//!
//! The filter comes from `SENSOR_LOG_LEVEL`, then `RUST_LOG`, then the
//! mode's default level. `SENSOR_LOG_MODE` picks the mode for
//! [`init_logging_from_env`].

use std::env::VarError;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

const LEVEL_VAR: &str = "SENSOR_LOG_LEVEL";
const MODE_VAR: &str = "SENSOR_LOG_MODE";

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber; every event is dropped
    Silent,
    /// Compact stderr output, `info` unless overridden
    Development,
    /// Pretty output with thread ids and source locations, `debug` unless overridden
    Debug,
}

impl LoggingMode {
    /// Mode named by a `SENSOR_LOG_MODE` value; unknown names are silent
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            Some(n) if n.eq_ignore_ascii_case("development") => LoggingMode::Development,
            Some(n) if n.eq_ignore_ascii_case("debug") => LoggingMode::Debug,
            _ => LoggingMode::Silent,
        }
    }

    fn default_level(self) -> Option<&'static str> {
        match self {
            LoggingMode::Silent => None,
            LoggingMode::Development => Some("info"),
            LoggingMode::Debug => Some("debug"),
        }
    }
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Install a global subscriber for `mode`
///
/// ```rust,ignore
/// sensor_service::logging::init_logging(LoggingMode::Development)?;
/// ```
///
/// Fails with [`LoggingError::TracingInit`] when a subscriber is already set.
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    let Some(default_level) = mode.default_level() else {
        return Ok(());
    };
    let filter = filter_from(std::env::var(LEVEL_VAR), std::env::var("RUST_LOG").ok(), default_level)?;

    let installed = match mode {
        LoggingMode::Debug => Registry::default()
            .with(
                fmt::layer()
                    .pretty()
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter)
            .try_init(),
        _ => Registry::default()
            .with(fmt::layer().compact().with_target(false))
            .with(filter)
            .try_init(),
    };
    installed.map_err(|e| LoggingError::TracingInit(e.to_string()))
}

/// Install the subscriber named by `SENSOR_LOG_MODE`
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var(MODE_VAR) {
        Ok(name) => LoggingMode::from_name(Some(&name)),
        Err(VarError::NotPresent) => LoggingMode::Silent,
        Err(VarError::NotUnicode(_)) => return Err(LoggingError::InvalidEnv(MODE_VAR.to_string())),
    };
    init_logging(mode)
}

/// Build the filter from the level override, `RUST_LOG` and the mode default
fn filter_from(
    level: Result<String, VarError>,
    rust_log: Option<String>,
    default_level: &str,
) -> Result<EnvFilter, LoggingError> {
    let directives = match level {
        Ok(level) => level,
        Err(VarError::NotUnicode(_)) => return Err(LoggingError::InvalidEnv(LEVEL_VAR.to_string())),
        Err(VarError::NotPresent) => rust_log.unwrap_or_else(|| default_level.to_string()),
    };
    EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidEnv(format!("{LEVEL_VAR}={directives}: {e}")))
}

/// Whether a global subscriber has been installed
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;

    use rstest::rstest;

    #[rstest]
    #[case(Some("development"), LoggingMode::Development)]
    #[case(Some(" Debug "), LoggingMode::Debug)]
    #[case(Some("verbose"), LoggingMode::Silent)]
    #[case(None, LoggingMode::Silent)]
    fn test_mode_names(#[case] name: Option<&str>, #[case] expected: LoggingMode) {
        assert_eq!(LoggingMode::from_name(name), expected);
    }

    #[test]
    fn test_silent_mode_installs_nothing() {
        assert!(init_logging(LoggingMode::Silent).is_ok());
        assert_eq!(LoggingMode::Silent.default_level(), None);
    }

    #[test]
    fn test_level_override_wins_over_rust_log() {
        let filter = filter_from(Ok("sensor_channel=trace".to_string()), Some("warn".to_string()), "info").unwrap();
        assert_eq!(filter.to_string(), "sensor_channel=trace");

        let filter = filter_from(Err(VarError::NotPresent), Some("warn".to_string()), "info").unwrap();
        assert_eq!(filter.to_string(), "warn");

        let filter = filter_from(Err(VarError::NotPresent), None, "debug").unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_unusable_level_is_invalid_env() {
        let not_unicode = VarError::NotUnicode(OsString::from_vec(vec![0xff, 0xfe]));
        assert!(matches!(
            filter_from(Err(not_unicode), None, "info"),
            Err(LoggingError::InvalidEnv(var)) if var == LEVEL_VAR
        ));
        assert!(matches!(
            filter_from(Ok("sensor_service=loud".to_string()), None, "info"),
            Err(LoggingError::InvalidEnv(_))
        ));
    }
}
