/// Core logging implementation with level filtering
///
/// Checks whether a message passes the configured threshold, then delegates
/// to the format module for rendering and writing.

use super::config::get_logger_config;
use super::levels::LogLevel;
use super::tags::LogTag;

/// Check if a log message should be displayed
///
/// Errors are always shown; everything else is gated on the minimum level.
pub fn should_log(level: LogLevel) -> bool {
    if level == LogLevel::Error {
        return true;
    }
    level <= get_logger_config().min_level
}

/// Internal logging function with automatic filtering
pub fn log_internal(tag: LogTag, level: LogLevel, message: &str) {
    if !should_log(level) {
        return;
    }

    super::format::format_and_log(tag, level, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_always_log() {
        assert!(should_log(LogLevel::Error));
    }

    #[test]
    fn test_verbose_filtered_by_default() {
        assert!(!should_log(LogLevel::Verbose));
    }
}
