//! Retry policy, exponential backoff, and failure classification.
//!
//! [`RetryPolicy`] is validated once at construction and immutable
//! afterwards. [`Retryable`] is the seam between concrete error types and
//! the execution engine: anything the engine runs must be able to say
//! whether its failure is worth another attempt.

use std::time::Duration;

use serde::Serialize;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default number of attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Upper bound on any single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
/// Factor applied to the delay after each failed attempt.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Wall-clock budget for a single attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Immutable retry/timeout policy for one kind of operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    timeout: Duration,
}

impl RetryPolicy {
    /// Build a validated policy.
    ///
    /// Rejects `max_attempts < 1`, `initial_delay >= max_delay`,
    /// `backoff_multiplier <= 1` (or non-finite) and a zero `timeout`.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        timeout: Duration,
    ) -> Result<Self, CoreError> {
        if max_attempts < 1 {
            return Err(CoreError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if initial_delay >= max_delay {
            return Err(CoreError::Validation(format!(
                "initial_delay ({}ms) must be less than max_delay ({}ms)",
                initial_delay.as_millis(),
                max_delay.as_millis()
            )));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier <= 1.0 {
            return Err(CoreError::Validation(format!(
                "backoff_multiplier must be greater than 1.0, got {backoff_multiplier}"
            )));
        }
        if timeout.is_zero() {
            return Err(CoreError::Validation(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            timeout,
        })
    }

    /// Short-fused policy for diagnostic probes (system stats, node
    /// catalogue). Two attempts, five-second timeout.
    pub fn probe() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            timeout: Duration::from_secs(5),
        }
    }

    /// Copy of this policy with a different per-attempt timeout.
    ///
    /// Long-running renders need a timeout that covers the whole
    /// history-polling budget.
    pub fn with_timeout(&self, timeout: Duration) -> Result<Self, CoreError> {
        Self::new(
            self.max_attempts,
            self.initial_delay,
            self.max_delay,
            self.backoff_multiplier,
            timeout,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Backoff to wait after the given (1-based) failed attempt.
    ///
    /// `min(initial_delay * multiplier^(attempt - 1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Timeouts, dropped connections, 5xx-style server faults.
    Retryable,
    /// Caller faults: authentication, validation, 4xx-style responses.
    Terminal,
}

/// Implemented by every error type the execution engine can run.
pub trait Retryable {
    fn error_class(&self) -> ErrorClass;
}

impl Retryable for CoreError {
    fn error_class(&self) -> ErrorClass {
        match self {
            CoreError::Validation(_) | CoreError::Conflict(_) => ErrorClass::Terminal,
            CoreError::Internal(msg) => classify_message(msg),
        }
    }
}

impl Retryable for String {
    fn error_class(&self) -> ErrorClass {
        classify_message(self)
    }
}

/// Words that mark a caller fault.
const TERMINAL_SIGNATURES: &[&str] = &[
    "unauthorized",
    "forbidden",
    "authentication",
    "invalid",
    "validation",
    "malformed",
    "bad request",
    "not found",
];

/// Words that mark a transient fault.
const RETRYABLE_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "econnreset",
    "econnrefused",
    "network",
    "unavailable",
    "temporarily",
];

/// HTTP statuses in the 4xx range that still warrant a retry.
const RETRYABLE_CLIENT_STATUSES: &[u16] = &[408, 429];

/// Classify an HTTP status code.
pub fn classify_status(status: u16) -> ErrorClass {
    if RETRYABLE_CLIENT_STATUSES.contains(&status) || status >= 500 {
        ErrorClass::Retryable
    } else if (400..500).contains(&status) {
        ErrorClass::Terminal
    } else {
        ErrorClass::Retryable
    }
}

/// Classify a free-form error message by its signature.
///
/// Status-code tokens win over keywords, terminal keywords win over
/// retryable ones, and anything unrecognised is treated as transient.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();

    let status = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() == 3)
        .filter_map(|t| t.parse::<u16>().ok())
        .find(|code| (400..600).contains(code));
    if let Some(code) = status {
        return classify_status(code);
    }

    if TERMINAL_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return ErrorClass::Terminal;
    }
    if RETRYABLE_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return ErrorClass::Retryable;
    }
    ErrorClass::Retryable
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
