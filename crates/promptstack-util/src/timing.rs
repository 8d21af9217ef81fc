//! Drop-based timing for slow operations.
//!
//! ```rust,ignore
//! let _timing = TimingGuard::tool("apply_changes");
//! // logged when `_timing` goes out of scope
//! ```

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Logs the elapsed time of an operation when dropped.
///
/// Fast operations log at debug, anything over `info_threshold` at info and
/// anything over `warn_threshold` at warn.
pub struct TimingGuard {
    kind: &'static str,
    name: String,
    start: Instant,
    info_threshold: Duration,
    warn_threshold: Duration,
}

impl TimingGuard {
    pub fn new(kind: &'static str, name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(kind, name = %name, "Starting operation");
        Self {
            kind,
            name,
            start: Instant::now(),
            info_threshold: Duration::from_millis(100),
            warn_threshold: Duration::from_secs(5),
        }
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self::new("tool", name)
    }

    /// Sandbox boots and pool provisioning routinely take tens of seconds.
    pub fn sandbox(name: impl Into<String>) -> Self {
        Self::new("sandbox", name).with_warn_threshold(Duration::from_secs(120))
    }

    pub fn with_info_threshold(mut self, threshold: Duration) -> Self {
        self.info_threshold = threshold;
        self
    }

    pub fn with_warn_threshold(mut self, threshold: Duration) -> Self {
        self.warn_threshold = threshold;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

fn format_duration(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    match ms {
        0..=999 => format!("{ms}ms"),
        1_000..=59_999 => format!("{:.2}s", elapsed.as_secs_f64()),
        _ => format!("{}m {:.1}s", ms / 60_000, (ms % 60_000) as f64 / 1000.0),
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        let duration = format_duration(elapsed);

        if elapsed >= self.warn_threshold {
            warn!(kind = self.kind, name = %self.name, duration_ms, duration = %duration, "Slow operation completed");
        } else if elapsed >= self.info_threshold {
            info!(kind = self.kind, name = %self.name, duration_ms, duration = %duration, "Operation completed");
        } else {
            debug!(kind = self.kind, name = %self.name, duration_ms, duration = %duration, "Operation completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(42)), "42ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_millis(61_500)), "1m 1.5s");
    }

    #[test]
    fn test_guard_measures_elapsed() {
        let guard = TimingGuard::tool("run_shell_command");
        std::thread::sleep(Duration::from_millis(5));
        assert!(guard.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_sandbox_guard_has_relaxed_warn_threshold() {
        let guard = TimingGuard::sandbox("boot");
        assert_eq!(guard.warn_threshold, Duration::from_secs(120));
    }
}
