//! Retry logic for network operations with intelligent error classification.

use log::{debug, warn};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;

use crate::error::InstallError;

/// Default number of attempts for network operations.
pub const MAX_RETRIES: usize = 3;

/// Delay before the first retry in milliseconds; doubles on every further attempt.
pub const RETRY_DELAY_MS: u64 = 1000;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            base_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Errors that should not be retried.
#[derive(Debug)]
pub enum NonRetryableError {
    /// Rate limit exceeded (HTTP 403 with rate limit message or 429)
    RateLimitExceeded(String),
    /// Authentication failed (HTTP 401)
    AuthenticationFailed(String),
    /// Resource not found (HTTP 404)
    NotFound(String),
    /// Forbidden access (HTTP 403 non-rate-limit)
    Forbidden(String),
    /// Other client errors that won't succeed on retry
    ClientError(String),
}

impl std::fmt::Display for NonRetryableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NonRetryableError::RateLimitExceeded(msg) => {
                write!(
                    f,
                    "Rate limit exceeded: {}. Try again later or set GITHUB_TOKEN environment variable.",
                    msg
                )
            }
            NonRetryableError::AuthenticationFailed(msg) => {
                write!(
                    f,
                    "Authentication failed: {}. Check your GITHUB_TOKEN.",
                    msg
                )
            }
            NonRetryableError::NotFound(msg) => {
                write!(f, "Not found: {}", msg)
            }
            NonRetryableError::Forbidden(msg) => {
                write!(f, "Access forbidden: {}. You may need authentication.", msg)
            }
            NonRetryableError::ClientError(msg) => {
                write!(f, "Request error: {}", msg)
            }
        }
    }
}

impl std::error::Error for NonRetryableError {}

/// Classifies an error as retryable or non-retryable.
/// Returns Ok(()) if the error is retryable, Err with a user-friendly message if not.
pub fn classify_error(error: &reqwest::Error) -> Result<(), NonRetryableError> {
    if let Some(status) = error.status() {
        match status {
            StatusCode::UNAUTHORIZED => {
                return Err(NonRetryableError::AuthenticationFailed(
                    "Invalid or missing authentication token".to_string(),
                ));
            }
            StatusCode::FORBIDDEN => {
                let msg = error.to_string();
                if msg.contains("rate limit") || msg.contains("API rate limit") {
                    return Err(NonRetryableError::RateLimitExceeded(
                        "GitHub API rate limit exceeded".to_string(),
                    ));
                }
                return Err(NonRetryableError::Forbidden(
                    "Access to this resource is forbidden".to_string(),
                ));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(NonRetryableError::RateLimitExceeded(
                    "Too many requests".to_string(),
                ));
            }
            StatusCode::NOT_FOUND => {
                return Err(NonRetryableError::NotFound(
                    error
                        .url()
                        .map(|u| u.to_string())
                        .unwrap_or_else(|| "The requested resource was not found".to_string()),
                ));
            }
            // Other 4xx client errors are generally not retryable
            s if s.is_client_error() => {
                return Err(NonRetryableError::ClientError(format!(
                    "HTTP {} error",
                    s.as_u16()
                )));
            }
            // 5xx server errors are retryable
            _ => {}
        }
    }

    // Connection errors, timeouts, etc. are retryable
    Ok(())
}

/// Checks if an error from `error_for_status()` should be retried.
/// Returns the original error if retryable, or a user-friendly NonRetryableError if not.
pub fn check_retryable(error: reqwest::Error) -> anyhow::Error {
    match classify_error(&error) {
        Ok(()) => anyhow::Error::from(error),
        Err(non_retryable) => anyhow::Error::from(non_retryable),
    }
}

/// Checks if an anyhow::Error is worth another attempt.
pub fn is_retryable_error(e: &anyhow::Error) -> bool {
    if e.downcast_ref::<NonRetryableError>().is_some() {
        return false;
    }
    // Taxonomy errors are decisions, not transport hiccups
    if e.downcast_ref::<InstallError>().is_some() {
        return false;
    }

    true
}

/// Final failure of [`with_retry`].
#[derive(Debug)]
pub struct RetryError {
    pub attempts: usize,
    pub error: anyhow::Error,
}

impl RetryError {
    pub fn into_inner(self) -> anyhow::Error {
        self.error
    }
}

/// Executes an async operation with retry logic.
/// Non-retryable errors fail immediately; everything else is retried with
/// exponential backoff until the policy's attempt budget is spent.
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, RetryError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable_error(&e) {
                    debug!("{}: non-retryable error: {}", operation_name, e);
                    return Err(RetryError {
                        attempts: attempt,
                        error: e,
                    });
                }
                if attempt >= max_attempts {
                    return Err(RetryError {
                        attempts: attempt,
                        error: e,
                    });
                }

                let delay = policy.delay_after(attempt);
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {}ms...",
                    operation_name,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
