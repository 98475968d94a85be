//! Exponential reconnect backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Reconnect delay schedule
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Schedule doubling from `min` up to `max`
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    /// Delay before the next attempt; jittered within the upper half of the
    /// current step so concurrent clients spread out
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let low = (base / 2).max(self.min.min(base));
        if low >= base {
            return base;
        }
        rand::thread_rng().gen_range(low..=base)
    }

    /// Delay without jitter for the current attempt
    fn base_delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over from the minimum delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut previous_cap = Duration::ZERO;

        for attempt in 0..10u32 {
            let delay = backoff.next_delay();
            let cap = Duration::from_secs(1)
                .saturating_mul(2u32.pow(attempt))
                .min(Duration::from_secs(30));
            assert!(delay <= cap, "attempt {} delay {:?} above {:?}", attempt, delay, cap);
            assert!(delay >= Duration::from_secs(1));
            assert!(cap >= previous_cap);
            previous_cap = cap;
        }
        assert_eq!(backoff.attempts(), 10);
    }

    #[test]
    fn test_first_delay_is_minimum() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_many_attempts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }
}
