//! Retry backoff: exponential with a cap and a jitter band.

use rand::Rng;
use std::time::Duration;

/// Backoff schedule for retryable job failures
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the second attempt
    pub base: Duration,
    /// Upper bound on any delay
    pub cap: Duration,
    /// Jitter fraction; the applied delay is drawn from
    /// `[delay * (1 - jitter), delay * (1 + jitter)]`
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Deterministic delay after `attempt` failures (attempt counts from
    /// 1): `base * 2^(attempt-1)`, capped.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 2u64.saturating_pow(exponent);
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.cap)
    }

    /// Delay with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter <= 0.0 {
            return raw;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let millis = raw.as_millis() as f64 * (1.0 + spread);
        Duration::from_millis(millis.max(0.0) as u64).min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(15 * 60),
            jitter: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_delays_are_non_decreasing_up_to_the_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(600), 0.0);
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = policy.raw_delay(attempt);
            assert!(delay >= previous, "attempt {attempt} regressed");
            assert!(delay <= Duration::from_secs(600));
            previous = delay;
        }
        assert_eq!(policy.raw_delay(1), Duration::from_secs(2));
        assert_eq!(policy.raw_delay(2), Duration::from_secs(4));
        assert_eq!(policy.raw_delay(3), Duration::from_secs(8));
        assert_eq!(policy.raw_delay(20), Duration::from_secs(600));
    }

    #[test]
    fn jitter_stays_inside_the_band() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(600), 0.2);
        for attempt in 1..=6 {
            let raw = policy.raw_delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let jittered = policy.delay(attempt).as_millis() as f64;
                assert!(jittered >= raw * 0.8 - 1.0);
                assert!(jittered <= (raw * 1.2 + 1.0).min(600_000.0));
            }
        }
    }

    #[test]
    fn extreme_attempts_do_not_overflow() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(900), 0.2);
        assert_eq!(policy.raw_delay(u32::MAX), Duration::from_secs(900));
        assert_eq!(policy.raw_delay(0), Duration::from_secs(5));
    }
}
