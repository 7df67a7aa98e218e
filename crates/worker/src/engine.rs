//! Execution engine: per-attempt timeout, retry with backoff, and circuit
//! breaking around a single async unit of work.
//!
//! The engine owns the circuit breaker for the ComfyUI server and is its
//! only writer. Clones share the same breaker.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reel_core::circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
use reel_core::retry::{ErrorClass, RetryPolicy, Retryable};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an execution ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A caller fault; never retried.
    Terminal,
    /// Every attempt failed with a retryable error.
    RetriesExhausted,
    /// The breaker refused the call.
    CircuitOpen,
    /// The final attempt exceeded its timeout.
    TimedOut,
    Cancelled,
}

/// Structured outcome of [`ExecutionEngine::execute_with_retry`].
#[derive(Debug)]
pub struct ExecutionResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub attempts: u32,
    pub total_time: Duration,
    /// Succeeded after at least one failed attempt.
    pub recovered: bool,
    pub failure: Option<FailureKind>,
}

impl<T> ExecutionResult<T> {
    fn succeeded(data: T, attempts: u32, total_time: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            attempts,
            total_time,
            recovered: attempts > 1,
            failure: None,
        }
    }

    pub(crate) fn failed(
        kind: FailureKind,
        error: impl Into<String>,
        attempts: u32,
        total_time: Duration,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            attempts,
            total_time,
            recovered: false,
            failure: Some(kind),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure == Some(FailureKind::Cancelled)
    }

    /// Collapse into a `Result`, keeping the error text.
    pub fn into_result(self) -> Result<T, String> {
        match self.data {
            Some(data) if self.success => Ok(data),
            _ => Err(self
                .error
                .unwrap_or_else(|| "Execution failed".to_string())),
        }
    }
}

/// Availability of the generation server as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    /// Service degraded, pausing new jobs until `retry_after_ms` elapses.
    Degraded { retry_after_ms: u64 },
}

impl ServiceHealth {
    pub fn from_snapshot(snapshot: &CircuitBreakerSnapshot) -> Self {
        match snapshot.state {
            CircuitState::Closed => Self::Healthy,
            CircuitState::Open => Self::Degraded {
                retry_after_ms: snapshot.cooldown_remaining_ms.unwrap_or(0),
            },
            CircuitState::HalfOpen => Self::Degraded { retry_after_ms: 0 },
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    breaker: Arc<Mutex<CircuitBreaker>>,
    default_policy: RetryPolicy,
}

impl ExecutionEngine {
    pub fn new(breaker: CircuitBreakerConfig, default_policy: RetryPolicy) -> Self {
        Self {
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(breaker))),
            default_policy,
        }
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Run `operation` under `policy` (or the engine default).
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        operation: F,
        label: &str,
        policy: Option<&RetryPolicy>,
    ) -> ExecutionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_cancellable(operation, label, policy, &CancellationToken::new())
            .await
    }

    /// [`execute_with_retry`](Self::execute_with_retry) that also stops,
    /// dropping the in-flight attempt, when `cancel` fires.
    pub async fn execute_cancellable<T, E, F, Fut>(
        &self,
        mut operation: F,
        label: &str,
        policy: Option<&RetryPolicy>,
        cancel: &CancellationToken,
    ) -> ExecutionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let policy = policy.unwrap_or(&self.default_policy);
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return ExecutionResult::failed(
                    FailureKind::Cancelled,
                    "Cancelled",
                    attempts,
                    started.elapsed(),
                );
            }

            let admission = match self.with_breaker(|b| b.try_acquire(now())) {
                Ok(admission) => admission,
                Err(open) => {
                    tracing::warn!(
                        label,
                        retry_after_ms = open.retry_after.as_millis() as u64,
                        "Service degraded, pausing new jobs",
                    );
                    return ExecutionResult::failed(
                        FailureKind::CircuitOpen,
                        format!("Service degraded, pausing new jobs: {open}"),
                        attempts,
                        started.elapsed(),
                    );
                }
            };
            attempts += 1;
            // Gives the half-open slot back if this attempt ends without an
            // outcome: cancelled, dropped, or unwound by a panic.
            let mut slot = HalfOpenSlot::new(&self.breaker, admission);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(label, attempt = attempts, "Execution cancelled");
                    return ExecutionResult::failed(
                        FailureKind::Cancelled,
                        "Cancelled",
                        attempts,
                        started.elapsed(),
                    );
                }
                r = tokio::time::timeout(policy.timeout(), operation()) => r,
            };

            // The operation may observe the same token and fail first.
            if cancel.is_cancelled() && !matches!(outcome, Ok(Ok(_))) {
                return ExecutionResult::failed(
                    FailureKind::Cancelled,
                    "Cancelled",
                    attempts,
                    started.elapsed(),
                );
            }

            let (message, kind) = match outcome {
                Ok(Ok(value)) => {
                    self.with_breaker(|b| b.record_success());
                    slot.disarm();
                    if attempts > 1 {
                        tracing::info!(label, attempts, "Recovered after retry");
                    }
                    return ExecutionResult::succeeded(value, attempts, started.elapsed());
                }
                Ok(Err(e)) if e.error_class() == ErrorClass::Terminal => {
                    // The server answered; only a probe learns anything.
                    if admission == Admission::Probe {
                        self.with_breaker(|b| b.record_success());
                    }
                    slot.disarm();
                    tracing::error!(label, attempt = attempts, error = %e, "Terminal error");
                    return ExecutionResult::failed(
                        FailureKind::Terminal,
                        e.to_string(),
                        attempts,
                        started.elapsed(),
                    );
                }
                Ok(Err(e)) => (e.to_string(), FailureKind::RetriesExhausted),
                Err(_) => (
                    format!("{label} timed out after {}ms", policy.timeout().as_millis()),
                    FailureKind::TimedOut,
                ),
            };

            let tripped = self.with_breaker(|b| {
                let before = b.state();
                b.record_failure(now());
                before != CircuitState::Open && b.state() == CircuitState::Open
            });
            slot.disarm();
            if tripped {
                tracing::warn!(label, "Circuit breaker opened");
            }

            if attempts >= policy.max_attempts() {
                tracing::error!(label, attempts, error = %message, "Giving up");
                return ExecutionResult::failed(kind, message, attempts, started.elapsed());
            }

            let delay = policy.delay_for_attempt(attempts);
            tracing::warn!(
                label,
                attempt = attempts,
                max_attempts = policy.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Attempt failed, retrying",
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return ExecutionResult::failed(
                        FailureKind::Cancelled,
                        "Cancelled",
                        attempts,
                        started.elapsed(),
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Operator reset: closed, zero failures.
    pub fn reset_circuit_breaker(&self) {
        self.with_breaker(|b| b.reset());
        tracing::info!("Circuit breaker reset");
    }

    pub fn circuit_snapshot(&self) -> CircuitBreakerSnapshot {
        self.with_breaker(|b| b.snapshot(now()))
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth::from_snapshot(&self.circuit_snapshot())
    }

    fn with_breaker<R>(&self, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut guard = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Half-open trial slot held for the length of one attempt.
struct HalfOpenSlot<'a> {
    breaker: Option<&'a Mutex<CircuitBreaker>>,
}

impl<'a> HalfOpenSlot<'a> {
    fn new(breaker: &'a Mutex<CircuitBreaker>, admission: Admission) -> Self {
        Self {
            breaker: (admission == Admission::Probe).then_some(breaker),
        }
    }

    /// The attempt recorded an outcome; nothing to give back.
    fn disarm(&mut self) {
        self.breaker = None;
    }
}

impl Drop for HalfOpenSlot<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release_probe();
        }
    }
}

/// Breaker clock. Follows tokio's clock so paused-time tests can drive
/// cooldowns.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}
