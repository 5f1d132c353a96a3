//! Enhanced Retry
//!
//! Wraps an async operation with bounded, classified retry:
//! - Errors are classified by code prefix; only network/timeout-class codes retry
//! - Exponential backoff capped at `max_delay_ms`
//! - Optional jitter in `[0, delay)` on top of the computed delay
//! - Cooperative cancellation between attempts
//!
//! State machine: `Idle -> Attempting -> {Succeeded | Delaying -> Attempting | Exhausted}`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error-code prefixes treated as transient
pub const DEFAULT_RETRYABLE_PREFIXES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ECONNABORTED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
    "ENETUNREACH",
    "EHOSTUNREACH",
    "NETWORK",
    "TIMEOUT",
    "RATE_LIMITED",
    "HTTP_429",
    "HTTP_502",
    "HTTP_503",
    "HTTP_504",
];

/// Retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds)
    pub base_delay_ms: u64,

    /// Upper bound on the computed delay (milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,

    /// Add random jitter in `[0, delay)`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,  // 1 second
            max_delay_ms: 30_000, // 30 seconds
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Invalid retry policy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Base delay {base_delay_ms}ms exceeds max delay {max_delay_ms}ms")]
    DelayOrder {
        base_delay_ms: u64,
        max_delay_ms: u64,
    },

    #[error("Backoff multiplier must be finite and >= 1.0, got {0}")]
    Multiplier(f64),
}

impl RetryPolicy {
    /// Check `base_delay_ms <= max_delay_ms` and a sane multiplier
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(PolicyError::DelayOrder {
                base_delay_ms: self.base_delay_ms,
                max_delay_ms: self.max_delay_ms,
            });
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(PolicyError::Multiplier(self.backoff_multiplier));
        }

        Ok(())
    }
}

/// Machine-readable code used to classify an error
pub trait ErrorCode {
    /// Code such as `ECONNRESET`, `HTTP_503` or `INVALID_GRANT`
    fn error_code(&self) -> Cow<'_, str>;
}

impl ErrorCode for io::Error {
    fn error_code(&self) -> Cow<'_, str> {
        let code = match self.kind() {
            io::ErrorKind::ConnectionReset => "ECONNRESET",
            io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
            io::ErrorKind::ConnectionAborted => "ECONNABORTED",
            io::ErrorKind::TimedOut => "ETIMEDOUT",
            io::ErrorKind::BrokenPipe => "EPIPE",
            io::ErrorKind::NotConnected => "ENOTCONN",
            io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
            io::ErrorKind::PermissionDenied => "EACCES",
            io::ErrorKind::NotFound => "ENOENT",
            _ => "EIO",
        };
        Cow::Borrowed(code)
    }
}

/// Coded error for operations that do not have their own error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct OperationError {
    /// Classification code
    pub code: String,

    /// Human-readable detail
    pub message: String,
}

impl OperationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Transient network failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new("NETWORK_ERROR", message)
    }

    /// Request deadline exceeded
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new("TIMEOUT", message)
    }

    /// HTTP status failure, coded as `HTTP_<status>`
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(format!("HTTP_{}", status), message)
    }
}

impl ErrorCode for OperationError {
    fn error_code(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.code)
    }
}

/// Final error of a retried operation
#[derive(Error, Debug)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Non-retryable failure, surfaced on the attempt that produced it
    #[error("{operation} failed with non-retryable error: {source}")]
    Fatal {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// Retry budget exhausted
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// Cancelled before the next attempt
    #[error("{operation} cancelled after {attempts} attempts")]
    Cancelled {
        operation: String,
        attempts: u32,
        last_error: Option<E>,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Number of times the operation was invoked
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Name passed to `execute`
    pub fn operation(&self) -> &str {
        match self {
            RetryError::Fatal { operation, .. }
            | RetryError::Exhausted { operation, .. }
            | RetryError::Cancelled { operation, .. } => operation,
        }
    }

    /// The last error returned by the operation, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Fatal { source, .. } | RetryError::Exhausted { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { last_error, .. } => last_error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RetryError::Fatal { .. })
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct EnhancedRetry {
    policy: RetryPolicy,
    retryable_prefixes: Vec<String>,
}

impl EnhancedRetry {
    /// Create an executor; the policy is validated up front
    pub fn new(policy: RetryPolicy) -> Result<Self, PolicyError> {
        policy.validate()?;

        Ok(Self {
            policy,
            retryable_prefixes: DEFAULT_RETRYABLE_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            policy: RetryPolicy::default(),
            retryable_prefixes: DEFAULT_RETRYABLE_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    /// Treat codes starting with `prefix` as retryable
    pub fn with_retryable_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().to_ascii_uppercase();
        if !self.retryable_prefixes.contains(&prefix) {
            self.retryable_prefixes.push(prefix);
        }
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether an error code belongs to the retryable set
    pub fn is_retryable(&self, code: &str) -> bool {
        let code = code.to_ascii_uppercase();
        self.retryable_prefixes
            .iter()
            .any(|prefix| code.starts_with(prefix.as_str()))
    }

    /// Backoff before the attempt following failed attempt `attempt` (1-based),
    /// without jitter: `min(max_delay, base_delay * multiplier^(attempt - 1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.policy.base_delay_ms as f64 * self.policy.backoff_multiplier.powi(exponent);

        // Cap at max_delay
        let capped = delay.min(self.policy.max_delay_ms as f64);

        Duration::from_millis(capped as u64)
    }

    /// Delay actually slept, including jitter when enabled
    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let delay_ms = delay.as_millis() as u64;

        if !self.policy.jitter || delay_ms == 0 {
            return delay;
        }

        // Uniform in [0, delay)
        let jitter_ms = rand::thread_rng().gen_range(0..delay_ms);
        delay + Duration::from_millis(jitter_ms)
    }

    /// Run `operation` until it succeeds, fails fatally or exhausts the budget
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
        operation_name: &str,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ErrorCode + 'static,
    {
        self.run(operation, operation_name, None).await
    }

    /// Like [`execute`](Self::execute), aborting before the next attempt once
    /// `cancel` fires
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        operation: F,
        operation_name: &str,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ErrorCode + 'static,
    {
        self.run(operation, operation_name, Some(cancel)).await
    }

    async fn run<F, Fut, T, E>(
        &self,
        mut operation: F,
        operation_name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ErrorCode + 'static,
    {
        let mut last_error: Option<E> = None;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                warn!(operation = %operation_name, attempts = attempt, "Retry cancelled");
                return Err(RetryError::Cancelled {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    last_error,
                });
            }

            attempt += 1;
            debug!(operation = %operation_name, attempt, "Attempting operation");

            let error = match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(
                            operation = %operation_name,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            let retryable = self.is_retryable(&error.error_code());
            if !retryable {
                warn!(
                    operation = %operation_name,
                    attempt,
                    code = %error.error_code(),
                    "Non-retryable error: {}",
                    error
                );
                return Err(RetryError::Fatal {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }

            if attempt > self.policy.max_retries {
                warn!(
                    operation = %operation_name,
                    attempts = attempt,
                    "Retries exhausted: {}",
                    error
                );
                return Err(RetryError::Exhausted {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.next_delay(attempt);
            warn!(
                operation = %operation_name,
                attempt,
                max_attempts = self.policy.max_retries.saturating_add(1),
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying: {}",
                error
            );
            last_error = Some(error);

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            warn!(operation = %operation_name, attempts = attempt, "Retry cancelled during backoff");
                            return Err(RetryError::Cancelled {
                                operation: operation_name.to_string(),
                                attempts: attempt,
                                last_error,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}
