//! Exponential backoff for transient sandbox and model failures.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const RETRY_INITIAL_DELAY_MS: u64 = 2000;
pub const RETRY_BACKOFF_FACTOR: u64 = 2;
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Delay before retry number `attempt` (1-based): 2s, 4s, 8s ... capped at 30s.
pub fn calculate_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = RETRY_INITIAL_DELAY_MS.saturating_mul(RETRY_BACKOFF_FACTOR.pow(exponent));
    Duration::from_millis(delay.min(RETRY_MAX_DELAY_MS))
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_with_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Attempt counter for a bounded retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            debug!(attempt = self.attempt, max = self.max_attempts, "Retry attempts exhausted");
            return None;
        }
        let delay = calculate_delay(self.attempt);
        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "Scheduling retry");
        Some(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RETRY_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_delay_doubles_and_caps() {
        assert_eq!(calculate_delay(1), Duration::from_millis(2000));
        assert_eq!(calculate_delay(2), Duration::from_millis(4000));
        assert_eq!(calculate_delay(4), Duration::from_millis(16_000));
        assert_eq!(calculate_delay(5), Duration::from_millis(30_000));
        assert_eq!(calculate_delay(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let mut backoff = Backoff::new(2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_with_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_with_cancel(Duration::from_secs(5), &cancel).await);
        cancel.cancel();
        assert!(!sleep_with_cancel(Duration::from_secs(5), &cancel).await);
    }
}
