//! Circuit-breaker state machine guarding the shared ComfyUI server.
//!
//! Pure logic: every method takes the current [`Instant`] so the caller
//! controls the clock. The execution engine owns one breaker per
//! server endpoint class behind a mutex and is the only writer.
//!
//! ```text
//! closed --(threshold failures within window)--> open
//! open   --(cooldown elapsed, one call admitted)--> half-open
//! half-open --(probe succeeds)--> closed
//! half-open --(probe fails)-----> open (cooldown restarts)
//! ```

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::CoreError;

/// Default consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Failures further apart than this do not accumulate.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(60);
/// How long the breaker stays open before admitting a probe.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Tunables for a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.failure_threshold == 0 {
            return Err(CoreError::Validation(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.failure_window.is_zero() {
            return Err(CoreError::Validation(
                "failure_window must be greater than zero".to_string(),
            ));
        }
        if self.cooldown.is_zero() {
            return Err(CoreError::Validation(
                "cooldown must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_window: DEFAULT_FAILURE_WINDOW,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call while closed.
    Allowed,
    /// The single trial call after the cooldown.
    Probe,
}

/// Returned by [`CircuitBreaker::try_acquire`] when calls are blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit open, retry after {}ms", .retry_after.as_millis())]
pub struct CircuitOpen {
    /// Time until a probe will be admitted. Zero while a probe is in flight.
    pub retry_after: Duration,
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Remaining cooldown while open.
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    /// A closed breaker with no recorded failures.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Ask permission to issue a call.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits exactly one probe; further calls are rejected until that
    /// probe reports back.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Admission, CircuitOpen> {
        match self.state {
            CircuitState::Closed => Ok(Admission::Allowed),
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(self.config.cooldown);
                if elapsed >= self.config.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Ok(Admission::Probe)
                } else {
                    Err(CircuitOpen {
                        retry_after: self.config.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    self.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Record a successful call. Closes the breaker and clears the count.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failure_at = Some(now);
                self.trip(now);
            }
            CircuitState::Closed => {
                let stale = self
                    .last_failure_at
                    .is_some_and(|last| now.saturating_duration_since(last) > self.config.failure_window);
                if stale {
                    self.consecutive_failures = 0;
                }
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failure_at = Some(now);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
            CircuitState::Open => {
                // A call admitted before the trip finished late; the
                // cooldown keeps running from the original trip.
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failure_at = Some(now);
            }
        }
    }

    /// Give back a probe slot without an outcome (the call was cancelled).
    pub fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    /// Operator reset: back to closed with zero failures.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_failure_at = None;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    pub fn snapshot(&self, now: Instant) -> CircuitBreakerSnapshot {
        let cooldown_remaining_ms = match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .cooldown
                    .saturating_sub(now.saturating_duration_since(at))
                    .as_millis() as u64,
            ),
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            cooldown_remaining_ms,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
