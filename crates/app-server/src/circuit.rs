//! Circuit breaker guarding spawn/initialize attempts.
//!
//! Consecutive failures trip the breaker open; while open, new attempts
//! are rejected immediately with a typed error. After the cooldown one
//! half-open probe is allowed through; success closes the breaker, another
//! failure re-opens it for a fresh cooldown.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use car_domain::error::{Error, Result};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_policy(name, DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }

    pub fn with_policy(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// Gate an attempt. Open circuits reject; an expired cooldown admits a
    /// single half-open probe.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    inner.state = State::HalfOpen;
                    tracing::info!(circuit = self.name, "circuit.half_open");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        cooldown_seconds: (until - now).as_secs_f64(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.consecutive_failures > 0 || inner.state != State::Closed {
            tracing::info!(circuit = self.name, "circuit.closed");
        }
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let tripped = matches!(inner.state, State::HalfOpen)
            || inner.consecutive_failures >= self.failure_threshold;
        if tripped {
            inner.state = State::Open {
                until: Instant::now() + self.cooldown,
            };
            tracing::warn!(
                circuit = self.name,
                consecutive_failures = inner.consecutive_failures,
                cooldown_seconds = self.cooldown.as_secs_f64(),
                "circuit.open"
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.check().is_err()
    }
}
