//! Logging initialization.
//!
//! `serve` logs to stdout; every other command appends to a file under the
//! local data directory so its printed output stays clean.

use promptstack_util::log::{self, LogConfig, LogLevel};
use std::path::PathBuf;

/// Initialize logging. Returns the log file path if logging to a file.
pub fn init_logging(verbose: bool, serving: bool, configured: Option<&str>) -> Option<PathBuf> {
    let level = if verbose {
        LogLevel::Debug
    } else {
        configured.and_then(LogLevel::parse).unwrap_or_default()
    };
    let file = if serving { None } else { log::default_log_path() };

    let config = LogConfig {
        print: serving,
        level,
        include_location: verbose,
        file: file.clone(),
    };
    if let Err(e) = log::init(config) {
        eprintln!("Warning: Could not initialize logging: {e}");
        return None;
    }
    file
}
