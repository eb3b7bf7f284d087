//! Retry with exponential backoff and error classification
//!
//! Provider errors are classified as transient (retried with backoff) or
//! permanent (surfaced immediately). Structural failures are handled one
//! level up by the adapters, which echo the violation back to the model
//! as feedback rather than blindly re-asking.

use crate::error::{AgentError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Classification of provider errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed on retry (rate limits, timeouts, 5xx-like)
    Transient,
    /// Will not succeed on retry (auth, bad request)
    Permanent,
    /// Unknown; treated as transient
    Unknown,
}

/// Retry strategy configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts beyond the first try
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Exponential multiplier
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Configuration with a custom retry count
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the initial backoff delay
    pub fn with_initial_backoff(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff delay for a given zero-based attempt
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms =
            (self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32)) as u64;
        let delay_ms = delay_ms.min(self.max_backoff_ms);
        let delay_ms = if self.jitter {
            let jitter_amount = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter_amount
        } else {
            delay_ms
        };
        Duration::from_millis(delay_ms)
    }
}

/// Classify a provider error by its message
pub fn classify_provider_error(error: &AgentError) -> ErrorClass {
    let AgentError::Provider(msg) = error else {
        return ErrorClass::Unknown;
    };
    let msg = msg.to_lowercase();

    if msg.contains("rate limit")
        || msg.contains("too many requests")
        || msg.contains("429")
        || msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("deadline exceeded")
        || msg.contains("503")
        || msg.contains("service unavailable")
        || msg.contains("502")
        || msg.contains("bad gateway")
        || msg.contains("500")
        || msg.contains("internal server error")
        || msg.contains("connection")
        || msg.contains("network")
        || msg.contains("dns")
        || msg.contains("overloaded")
    {
        return ErrorClass::Transient;
    }

    if msg.contains("401")
        || msg.contains("unauthorized")
        || msg.contains("invalid api key")
        || msg.contains("authentication")
        || msg.contains("403")
        || msg.contains("forbidden")
        || msg.contains("404")
        || msg.contains("not found")
        || msg.contains("400")
        || msg.contains("bad request")
        || msg.contains("invalid request")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Execute an operation with retries, backoff, and cooperative cancel
///
/// The cancel signal is checked before every attempt; a set signal aborts
/// with [`AgentError::Cancelled`]. Permanent errors abort immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &watch::Receiver<bool>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        if *cancel.borrow() {
            info!(operation = operation_name, "Cancelled before attempt");
            return Err(AgentError::Cancelled);
        }
        if attempt > 0 {
            info!(
                operation = operation_name,
                attempt = attempt,
                max_retries = config.max_retries,
                "Retrying operation"
            );
        }

        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => {
                let class = classify_provider_error(&e);
                debug!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    classification = ?class,
                    "Operation failed"
                );

                if class == ErrorClass::Permanent {
                    error!(
                        operation = operation_name,
                        error = %e,
                        "Permanent error, aborting retries"
                    );
                    return Err(e);
                }

                last_error = Some(e);
                if attempt < config.max_retries {
                    let delay = config.backoff_delay(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient error, will retry after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        AgentError::Provider(format!(
            "Operation '{}' failed after {} retries",
            operation_name, config.max_retries
        ))
    }))
}
