/// Logger configuration state
///
/// Holds the minimum level threshold and the optional file sink path.
/// Configured once at startup from CLI flags, read on every log call.

use super::levels::LogLevel;
use once_cell::sync::Lazy;
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub log_file: Option<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            log_file: None,
        }
    }
}

static LOGGER_CONFIG: Lazy<RwLock<LoggerConfig>> =
    Lazy::new(|| RwLock::new(LoggerConfig::default()));

/// Initialize from CLI flags (--debug raises to Debug, --verbose to Verbose)
pub fn init(debug: bool, verbose: bool) {
    let min_level = if verbose {
        LogLevel::Verbose
    } else if debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let mut config = LOGGER_CONFIG.write().unwrap();
    config.min_level = min_level;
}

/// Set the log file path (appended to on every log call)
pub fn set_log_file(path: &str) {
    let mut config = LOGGER_CONFIG.write().unwrap();
    config.log_file = Some(path.to_string());
}

/// Get a snapshot of the current logger configuration
pub fn get_logger_config() -> LoggerConfig {
    LOGGER_CONFIG.read().unwrap().clone()
}
