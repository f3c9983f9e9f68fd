//! Retry schedule for transient transport failures

use std::time::Duration;

/// Exponential backoff schedule with jitter, indexed by attempt number.
///
/// The session retries retryable transport errors only; timeouts and auth
/// failures surface immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial: Duration,
    /// Delay ceiling
    pub max: Duration,
    /// Multiplier per retry
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_amount = base.as_secs_f64() * self.jitter * rand::random::<f64>();
        base + Duration::from_secs_f64(jitter_amount)
    }

    /// Deterministic part of the delay, capped at `max`
    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let raw = Duration::from_secs_f64(self.initial.as_secs_f64() * factor);
        std::cmp::min(raw, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_doubles() {
        let policy = no_jitter();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = no_jitter();
        assert_eq!(policy.delay(10), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..32 {
            let d = policy.delay(0);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_millis(1500));
        }
    }
}
