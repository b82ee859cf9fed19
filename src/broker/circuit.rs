//! Per-subscription circuit breaker.
//!
//! `Closed` counts consecutive failures (handler exhaustion and queue-full
//! drops alike). Reaching the threshold opens the circuit. While `Open`, no
//! delivery is attempted until the cooldown has elapsed; the first check
//! after that moves to `HalfOpen` and lets exactly one message through as a
//! probe. The probe's outcome closes the circuit or re-opens it with a fresh
//! cooldown.
//!
//! The breaker is shared between its delivery worker and the publish path,
//! so it lives behind a short-lived `Mutex` and takes the current instant
//! as an argument instead of reading a clock itself.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Decide whether a delivery may start at `now`.
    ///
    /// An open circuit whose cooldown has elapsed transitions to `HalfOpen`
    /// and admits the caller as the single probe. A half-open circuit
    /// refuses further callers until the probe reports back.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .is_none_or(|opened| now.saturating_duration_since(opened) >= self.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                }
                cooled
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Record a failure. Returns true when this failure tripped the circuit
    /// (`Closed -> Open` or `HalfOpen -> Open`); failures observed while
    /// already open do not count as a new trip.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.open(now);
                true
            }
            CircuitState::HalfOpen => {
                self.open(now);
                true
            }
            _ => false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
    }
}
