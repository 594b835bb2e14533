// =============================================================================
// Circuit Breaker — fail-fast wrapper around upstream calls
// =============================================================================
//
// States: Closed (normal), Open (fail-fast for reset_timeout), HalfOpen
// (exactly one probe allowed). Closed trips to Open on max_failures
// consecutive errors; Open relaxes to HalfOpen after reset_timeout; the
// HalfOpen probe either closes the breaker on success or reopens it.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ScanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            max_failures: max_failures.max(1),
            reset_timeout,
        }
    }

    /// Gate an upstream call. Returns `Err(CircuitOpen)` without any I/O when
    /// the breaker is open, or admits the call (possibly as the half-open
    /// probe) otherwise. Every `Ok` must be matched by `on_success` or
    /// `on_failure`.
    pub fn check(&self) -> Result<(), ScanError> {
        let mut s = self.inner.lock();
        match s.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = s.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout {
                    info!("circuit breaker half-open — admitting probe call");
                    s.state = CircuitState::HalfOpen;
                    s.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(ScanError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if s.probe_in_flight {
                    Err(ScanError::CircuitOpen)
                } else {
                    s.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut s = self.inner.lock();
        if s.state != CircuitState::Closed {
            info!("circuit breaker closed — upstream recovered");
        }
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.opened_at = None;
        s.probe_in_flight = false;
    }

    pub fn on_failure(&self) {
        let mut s = self.inner.lock();
        match s.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker probe failed — reopening");
                s.state = CircuitState::Open;
                s.opened_at = Some(Instant::now());
                s.probe_in_flight = false;
            }
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.max_failures {
                    warn!(
                        failures = s.consecutive_failures,
                        "circuit breaker opened — failing fast"
                    );
                    s.state = CircuitState::Open;
                    s.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {
                // Late failure from a call admitted before the trip.
                s.consecutive_failures += 1;
            }
        }
    }

    /// Release an admission that never reached upstream (e.g. every request
    /// in the batch expired while waiting for a permit). Leaves the failure
    /// streak untouched but frees the half-open probe slot.
    pub fn on_cancel(&self) {
        let mut s = self.inner.lock();
        if s.state == CircuitState::HalfOpen {
            s.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[cfg(test)]
    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: five consecutive failures trip the breaker; the next call is
    /// rejected immediately without touching the network.
    #[test]
    fn opens_after_max_failures() {
        let cb = CircuitBreaker::new(5, Duration::from_secs(30));

        for _ in 0..5 {
            assert!(cb.check().is_ok());
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let started = Instant::now();
        let err = cb.check().unwrap_err();
        assert!(matches!(err, ScanError::CircuitOpen));
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    #[test]
    fn stays_closed_below_threshold() {
        let cb = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            assert!(cb.check().is_ok());
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 4);

        // A success resets the streak.
        assert!(cb.check().is_ok());
        cb.on_success();
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(20));
        for _ in 0..2 {
            cb.check().unwrap();
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());

        std::thread::sleep(Duration::from_millis(30));

        // One probe is admitted; a second concurrent call is rejected.
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.check().is_err());

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(20));
        cb.check().unwrap();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.check().is_ok());
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Freshly reopened: fail fast again.
        assert!(cb.check().is_err());
    }
}
