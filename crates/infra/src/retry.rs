//! Retry policy and executor for single units of remote work.
//!
//! The executor does not classify errors itself. The unit of work decides
//! whether a failure is worth another attempt by implementing [`Retryable`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use backfill_core::ConfigurationError;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigurationError::new(
                "retry.jitter",
                format!("{} is outside 0.0..=1.0", self.jitter),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigurationError::new(
                "retry.max_delay",
                "is shorter than base_delay",
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((retry - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * retry as f64).min(max_ms),
        };

        // Deterministic jitter derived from the retry number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((retry as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another retry is allowed after `retries_so_far` retries.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

/// Implemented by errors of retryable units of work.
pub trait Retryable {
    /// Whether another attempt may succeed.
    fn is_transient(&self) -> bool;
}

/// Why a retried unit of work did not succeed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("non-retryable failure on attempt {attempts}: {error}")]
    NonRetryable { attempts: u32, error: E },

    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The last failure, unless the work was cancelled.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::NonRetryable { error, .. } => Some(error),
            RetryError::Cancelled => None,
        }
    }
}

/// Runs a unit of work under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` (called with the 1-indexed attempt number) until it
    /// succeeds, fails permanently, runs out of retries, or `cancel` fires.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = operation(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(RetryError::NonRetryable {
                    attempts: attempt,
                    error,
                });
            }
            let retries_so_far = attempt - 1;
            if !self.policy.should_retry(retries_so_far) {
                warn!(attempts = attempt, error = %error, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.policy.delay_for_retry(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "transient failure, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
