//! Exponential reconnection backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Jitter applied to every delay, as a fraction of the nominal value.
const JITTER: f64 = 0.3;

#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are
    /// exhausted. Delays follow `min(max, base * 2^(attempt-1))` with
    /// +/-30% jitter.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        let exponent = self.attempt.saturating_sub(1).min(31);
        let nominal = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.max)
            .as_secs_f64();
        let jitter = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        Some(Duration::from_secs_f64(nominal * jitter))
    }

    /// Forget past failures after a connection proved healthy.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_within_jitter(delay: Duration, nominal_secs: f64) {
        let secs = delay.as_secs_f64();
        assert!(
            secs >= nominal_secs * (1.0 - JITTER) - 1e-9
                && secs <= nominal_secs * (1.0 + JITTER) + 1e-9,
            "delay {secs}s outside +/-30% of {nominal_secs}s"
        );
    }

    #[test]
    fn delays_double_with_jitter() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 10);
        assert_within_jitter(backoff.next_delay().unwrap(), 1.0);
        assert_within_jitter(backoff.next_delay().unwrap(), 2.0);
        assert_within_jitter(backoff.next_delay().unwrap(), 4.0);
        assert_within_jitter(backoff.next_delay().unwrap(), 8.0);
    }

    #[test]
    fn delays_are_capped_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 20);
        for _ in 0..10 {
            backoff.next_delay().unwrap();
        }
        // attempt 11 nominally 1024s, capped at 30s
        assert_within_jitter(backoff.next_delay().unwrap(), 30.0);
    }

    #[test]
    fn attempts_exhaust_and_reset_restores() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 3);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_within_jitter(backoff.next_delay().unwrap(), 0.01);
    }

    #[test]
    fn large_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 100);
        for _ in 0..100 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_secs(39));
        }
        assert!(backoff.next_delay().is_none());
    }
}
