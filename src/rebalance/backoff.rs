//! Exponential retry backoff with jitter.

use crate::config::WorkerConfig;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use std::time::Duration;

/// Failure-driven retry delay.
///
/// The n-th consecutive failure waits `min(base * 2^(n-1), max)`, scaled by
/// a random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter: f64,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base_ms: base.as_millis().min(u64::MAX as u128) as u64,
            max_ms: max.as_millis().min(u64::MAX as u128) as u64,
            jitter: jitter.clamp(0.0, 1.0),
            failures: 0,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
            config.retry_jitter.to_f64().unwrap_or(0.0),
        )
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the retry following the n-th consecutive failure, without jitter.
    pub fn capped_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }

    /// Count a failure and return the jittered delay to wait.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.capped_delay(self.failures);
        if self.jitter == 0.0 {
            return delay;
        }
        let scale = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * scale)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);

        assert_eq!(backoff.capped_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.capped_delay(2), Duration::from_secs(2));
        assert_eq!(backoff.capped_delay(6), Duration::from_secs(32));
        assert_eq!(backoff.capped_delay(7), Duration::from_secs(60));
        assert_eq!(backoff.capped_delay(500), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.25);

        for _ in 0..100 {
            backoff.reset();
            let delay = backoff.record_failure();
            assert!(delay >= Duration::from_millis(750), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1250), "{:?}", delay);
        }
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 0.0);

        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.record_failure(), Duration::from_millis(400));
        assert_eq!(backoff.failures(), 3);

        backoff.reset();
        assert_eq!(backoff.record_failure(), Duration::from_millis(100));
    }
}
