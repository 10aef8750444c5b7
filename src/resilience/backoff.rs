//! Exponential backoff with jitter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    // Up to 10% jitter so reconnecting tasks do not align
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Consecutive failure counter shared by a periodic task.
#[derive(Debug)]
pub struct FailureStreak {
    failures: AtomicU32,
    base_ms: u64,
    max_ms: u64,
}

impl FailureStreak {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            failures: AtomicU32::new(0),
            base_ms,
            max_ms,
        }
    }

    /// Record a failure and return how long to hold off before the next try.
    pub fn record_failure(&self) -> Duration {
        let attempt = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        calculate_backoff(attempt, self.base_ms, self.max_ms)
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, 100, 2000), Duration::ZERO);

        let b1 = calculate_backoff(1, 100, 2000);
        assert!(b1.as_millis() >= 100 && b1.as_millis() < 110);

        let b3 = calculate_backoff(3, 100, 2000);
        assert!(b3.as_millis() >= 400);

        let capped = calculate_backoff(20, 100, 1000);
        assert!(capped.as_millis() >= 1000 && capped.as_millis() < 1100);
    }

    #[test]
    fn test_failure_streak() {
        let streak = FailureStreak::new(1000, 60_000);
        assert!(streak.record_failure() >= Duration::from_secs(1));
        assert!(streak.record_failure() >= Duration::from_secs(2));
        assert_eq!(streak.failures(), 2);

        streak.reset();
        assert_eq!(streak.failures(), 0);
    }
}
