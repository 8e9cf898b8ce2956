//! Per-upstream circuit breaker.
//!
//! Each user's agent (and the local origin behind it) is one protected
//! upstream. Transitions follow consecutive-count thresholds: closed
//! opens after `failure_threshold` consecutive failures, open admits a
//! probe after `reset_timeout`, half-open closes after
//! `success_threshold` consecutive probe successes and reopens on any
//! probe failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::metrics::{METRIC_CIRCUIT_STATE, METRIC_CIRCUIT_TRANSITIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Probes admitted since entering half-open.
    probes_in_flight: u32,
    last_failure: Option<Instant>,
    last_transition: Instant,
}

/// Breaker for one protected upstream.
pub struct CircuitBreaker {
    key: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

/// Error returned when the circuit refuses a call.
#[derive(Debug, thiserror::Error)]
#[error("circuit open for {key}, retry in {retry_after_secs}s")]
pub struct CircuitOpen {
    pub key: String,
    pub retry_after_secs: u64,
}

impl CircuitBreaker {
    fn new(key: String, settings: BreakerSettings) -> Self {
        Self {
            key,
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                probes_in_flight: 0,
                last_failure: None,
                last_transition: Instant::now(),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Admit a call or fail fast. A successful acquire must be paired
    /// with exactly one `record_success` or `record_failure`.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.last_transition.elapsed();
                if elapsed >= self.settings.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probes_in_flight = 1;
                    Ok(())
                } else {
                    let retry = self.settings.reset_timeout - elapsed;
                    Err(CircuitOpen {
                        key: self.key.clone(),
                        retry_after_secs: retry.as_secs().max(1),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.settings.success_threshold {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        key: self.key.clone(),
                        retry_after_secs: self.settings.reset_timeout.as_secs().max(1),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.settings.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A success racing an open transition does not close the circuit.
            CircuitState::Open => {}
        }
    }

    /// Release an acquired permit without counting it for or against
    /// the upstream (broker-side refusals like `queue_full`).
    pub fn record_neutral(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        inner.consecutive_successes = 0;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = 0;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        tracing::info!(
            upstream = %self.key,
            from = from.as_str(),
            to = to.as_str(),
            "circuit transition"
        );
        inner.state = to;
        inner.last_transition = Instant::now();
        if to == CircuitState::Closed {
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            inner.probes_in_flight = 0;
        }
        if to == CircuitState::HalfOpen {
            inner.consecutive_successes = 0;
        }
        metrics::counter!(
            METRIC_CIRCUIT_TRANSITIONS,
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        metrics::gauge!(METRIC_CIRCUIT_STATE, "upstream" => self.key.clone()).set(to as u8 as f64);
    }
}

/// Lazily-created breakers keyed by upstream (user id).
pub struct BreakerMap {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerMap {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key.to_owned(), self.settings)))
            .clone()
    }

    /// States of all known breakers, for diagnostics.
    pub fn snapshot(&self) -> Vec<(String, &'static str)> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state().as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(50),
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("u1".to_owned(), settings())
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let b = breaker();
        for _ in 0..2 {
            b.try_acquire().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed);
        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let b = breaker();
        b.try_acquire().unwrap();
        b.record_failure();
        b.try_acquire().unwrap();
        b.record_failure();
        b.try_acquire().unwrap();
        b.record_success();
        for _ in 0..2 {
            b.try_acquire().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_closes_after_probe_successes() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        b.try_acquire().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.try_acquire().unwrap();
        // probe budget exhausted
        assert!(b.try_acquire().is_err());

        b.record_success();
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap();
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn open_fails_fast_until_reset_timeout() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap();
            b.record_failure();
        }
        let err = b.try_acquire().unwrap_err();
        assert!(err.retry_after_secs >= 1);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn map_reuses_breakers_per_key() {
        let map = BreakerMap::new(settings());
        let a = map.get("u1");
        let b = map.get("u1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.snapshot().len(), 1);
    }
}
