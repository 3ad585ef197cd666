//! Structured logging for perpbot
//!
//! Provides a tag + level logging API with:
//! - Standard log levels (Error/Warning/Info/Debug/Verbose)
//! - Per-subsystem tags
//! - Dual output: colored console + optional file persistence
//!
//! ## Usage
//!
//! ```rust
//! use perpbot::logger::{self, LogTag};
//!
//! logger::error(LogTag::Exchange, "Connection failed");
//! logger::info(LogTag::Trader, "Position opened");
//! logger::debug(LogTag::Ai, "Prompt length: 12034"); // Only with --debug
//! ```
//!
//! Call `logger::init(...)` once at startup before any logging occurs.

mod config;
mod core;
mod format;
mod levels;
mod tags;

pub use config::LoggerConfig;
pub use levels::LogLevel;
pub use tags::LogTag;

/// Initialize the logger system
///
/// Must be called once at application startup. Configures the minimum level
/// threshold and the optional log file sink.
pub fn init(debug: bool, verbose: bool, log_file: Option<String>) {
    config::init(debug, verbose);
    if let Some(path) = log_file {
        config::set_log_file(&path);
    }
}

/// Log at ERROR level (always shown, critical issues)
pub fn error(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Error, message);
}

/// Log at WARNING level (important issues, shown by default)
pub fn warning(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Warning, message);
}

/// Log at INFO level (standard operations)
pub fn info(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Info, message);
}

/// Log at DEBUG level (detailed diagnostics, gated by --debug)
pub fn debug(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Debug, message);
}

/// Log at VERBOSE level (very detailed tracing, gated by --verbose)
pub fn verbose(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Verbose, message);
}
