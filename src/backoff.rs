//! Exponential backoff with jitter, shared by store retries, workflow node
//! retries and background maintenance loops.

use rand::Rng;
use std::time::Duration;

/// `base * 2^(attempt-1)` plus up to `base` of jitter, capped at `cap`
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    if attempt == 0 || base.is_zero() {
        return Duration::ZERO;
    }
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64);
    exp.saturating_add(Duration::from_millis(jitter_ms)).min(cap)
}

/// Tracks consecutive failures of a periodic loop
#[derive(Debug, Clone)]
pub struct FailureBackoff {
    base: Duration,
    cap: Duration,
    consecutive_failures: u32,
}

impl FailureBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Returns the extra delay before the next iteration
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        backoff_delay(self.base, self.consecutive_failures, self.cap)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 0, cap), Duration::ZERO);

        let first = backoff_delay(base, 1, cap);
        assert!(first >= base && first <= base * 2);

        let third = backoff_delay(base, 3, cap);
        assert!(third >= Duration::from_millis(400));

        assert_eq!(backoff_delay(base, 30, cap), cap);
    }

    #[test]
    fn test_failure_backoff_resets() {
        let mut b = FailureBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.consecutive_failures(), 2);
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
    }
}
