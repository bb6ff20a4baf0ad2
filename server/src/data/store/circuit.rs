//! Circuit breaker for external dependencies
//!
//! 5 failures within 60 s open the circuit for 60 s; while half-open the
//! first 3 attempts probe recovery. A probe success closes the circuit, a
//! probe failure re-opens it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::constants::{
    BREAKER_FAILURE_THRESHOLD, BREAKER_HALF_OPEN_PROBES, BREAKER_OPEN_SECS, BREAKER_WINDOW_SECS,
};

#[derive(Debug)]
enum BreakerState {
    Closed { failures: VecDeque<Instant> },
    Open { until: Instant },
    HalfOpen { probes_left: u32 },
}

/// Circuit breaker guarding one external dependency
pub struct CircuitBreaker {
    name: &'static str,
    state: Mutex<BreakerState>,
    failure_threshold: usize,
    window: Duration,
    open_for: Duration,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(BreakerState::Closed {
                failures: VecDeque::new(),
            }),
            failure_threshold: BREAKER_FAILURE_THRESHOLD,
            window: Duration::from_secs(BREAKER_WINDOW_SECS),
            open_for: Duration::from_secs(BREAKER_OPEN_SECS),
        }
    }

    /// Whether an attempt may proceed right now.
    ///
    /// Transitions open → half-open once the open interval has elapsed and
    /// consumes one probe slot per admitted half-open attempt.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    tracing::debug!(breaker = self.name, "Circuit half-open, probing");
                    *state = BreakerState::HalfOpen {
                        probes_left: BREAKER_HALF_OPEN_PROBES - 1,
                    };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { probes_left } => {
                if *probes_left > 0 {
                    *probes_left -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            BreakerState::Closed { failures } => failures.clear(),
            BreakerState::HalfOpen { .. } | BreakerState::Open { .. } => {
                tracing::info!(breaker = self.name, "Circuit closed after recovery");
                *state = BreakerState::Closed {
                    failures: VecDeque::new(),
                };
            }
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        match &mut *state {
            BreakerState::Closed { failures } => {
                failures.push_back(now);
                while failures
                    .front()
                    .is_some_and(|&t| now.duration_since(t) > self.window)
                {
                    failures.pop_front();
                }
                if failures.len() >= self.failure_threshold {
                    tracing::warn!(
                        breaker = self.name,
                        failures = failures.len(),
                        "Circuit opened"
                    );
                    *state = BreakerState::Open {
                        until: now + self.open_for,
                    };
                }
            }
            BreakerState::HalfOpen { .. } => {
                tracing::warn!(breaker = self.name, "Probe failed, circuit re-opened");
                *state = BreakerState::Open {
                    until: now + self.open_for,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    #[cfg(test)]
    fn with_timings(name: &'static str, window: Duration, open_for: Duration) -> Self {
        Self {
            name,
            state: Mutex::new(BreakerState::Closed {
                failures: VecDeque::new(),
            }),
            failure_threshold: BREAKER_FAILURE_THRESHOLD,
            window,
            open_for,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("test");
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            assert!(breaker.allow());
            breaker.record_failure();
        }
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_clears_failure_window() {
        let breaker = CircuitBreaker::new("test");
        for _ in 0..BREAKER_FAILURE_THRESHOLD - 1 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..BREAKER_FAILURE_THRESHOLD - 1 {
            breaker.record_failure();
        }
        assert!(breaker.allow());
    }

    #[test]
    fn test_half_open_admits_limited_probes() {
        let breaker =
            CircuitBreaker::with_timings("test", Duration::from_secs(60), Duration::ZERO);
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            breaker.record_failure();
        }

        // Open interval is zero, so the next allow flips to half-open
        for _ in 0..BREAKER_HALF_OPEN_PROBES {
            assert!(breaker.allow());
        }
        assert!(!breaker.allow());
    }

    #[test]
    fn test_probe_success_closes_circuit() {
        let breaker =
            CircuitBreaker::with_timings("test", Duration::from_secs(60), Duration::ZERO);
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        assert!(breaker.allow());
        breaker.record_success();
        assert!(breaker.allow());
    }

    #[test]
    fn test_probe_failure_reopens_circuit() {
        let breaker = CircuitBreaker::with_timings(
            "test",
            Duration::from_secs(60),
            Duration::from_millis(0),
        );
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        assert!(breaker.allow());
        breaker.record_failure();
        // Re-opened with a fresh (zero) interval; first allow goes half-open again
        assert!(breaker.allow());
    }
}
