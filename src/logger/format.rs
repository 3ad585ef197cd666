/// Log formatting and output
///
/// Renders `HH:MM:SS [TAG] LEVEL message` with a colored level on the
/// console and a plain copy appended to the log file when configured.

use super::config::get_logger_config;
use super::levels::LogLevel;
use super::tags::LogTag;
use colored::Colorize;
use std::fs::OpenOptions;
use std::io::Write;

pub fn format_and_log(tag: LogTag, level: LogLevel, message: &str) {
    let timestamp = chrono::Local::now().format("%H:%M:%S");
    let tag_str = format!("[{}]", tag.as_str());

    let level_colored = match level {
        LogLevel::Error => level.as_str().red().bold(),
        LogLevel::Warning => level.as_str().yellow(),
        LogLevel::Info => level.as_str().green(),
        LogLevel::Debug => level.as_str().cyan(),
        LogLevel::Verbose => level.as_str().dimmed(),
    };

    if level == LogLevel::Error {
        eprintln!("{} {:<10} {} {}", timestamp, tag_str.bold(), level_colored, message);
    } else {
        println!("{} {:<10} {} {}", timestamp, tag_str.bold(), level_colored, message);
    }

    // File sink gets the plain rendering
    if let Some(path) = get_logger_config().log_file {
        let line = format!("{} {:<10} {} {}\n", timestamp, tag_str, level.as_str(), message);
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = file.write_all(line.as_bytes());
        }
    }
}
