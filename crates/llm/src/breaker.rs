//! Circuit breaker guarding the LLM endpoint.
//!
//! CLOSED → OPEN after `failure_threshold` consecutive failures; OPEN →
//! HALF_OPEN once `recovery` has elapsed at the next admission attempt;
//! HALF_OPEN → CLOSED after `half_open_admit_max` consecutive successes, or
//! back to OPEN on any failure. A 429 is "busy", not a failure, and never
//! moves the breaker.

use std::sync::Mutex;
use std::time::Instant;

use tracing::{info, warn};

use maestro_config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker to admit one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Admitted as a half-open probe; the limiter caps concurrency while any
    /// probe is outstanding.
    Probe,
    Rejected,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Ask to admit one request. While OPEN everything is rejected until the
    /// recovery timer elapses; the first admission after that becomes a
    /// HALF_OPEN probe.
    pub fn try_admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Admission::Admitted,
            BreakerState::HalfOpen => Admission::Probe,
            BreakerState::Open => {
                let recovered = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery())
                    .unwrap_or(true);
                if recovered {
                    info!("circuit breaker half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_admit_max {
                info!("circuit breaker closed");
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
                inner.half_open_successes = 0;
            }
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("half-open probe failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
                inner.consecutive_failures = self.config.failure_threshold;
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == BreakerState::HalfOpen
    }

    /// True while OPEN with the recovery timer still running, the window in
    /// which new submissions are rejected without reaching the queue.
    pub fn would_reject(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == BreakerState::Open
            && inner
                .opened_at
                .map(|at| at.elapsed() < self.config.recovery())
                .unwrap_or(false)
    }

    /// Concurrency cap applied by the limiter while half-open.
    pub fn half_open_cap(&self) -> usize {
        self.config.half_open_admit_max as usize
    }
}
