//! The contract every job's per-batch work must satisfy.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use backfill_core::{BatchTarget, ConfigurationError};

use crate::collaborators::CollaboratorError;
use crate::retry::Retryable;
use crate::stream::StreamError;

/// Failure of one activity invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    /// Worth retrying (timeouts, throttling, unavailable stores).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying will not help.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("activity cancelled")]
    Cancelled,
}

impl ActivityError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

impl Retryable for ActivityError {
    fn is_transient(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }
}

impl From<CollaboratorError> for ActivityError {
    fn from(err: CollaboratorError) -> Self {
        if err.is_transient() {
            ActivityError::Transient(err.to_string())
        } else {
            ActivityError::Permanent(err.to_string())
        }
    }
}

impl From<ConfigurationError> for ActivityError {
    fn from(err: ConfigurationError) -> Self {
        ActivityError::Permanent(err.to_string())
    }
}

impl From<StreamError<ActivityError>> for ActivityError {
    fn from(err: StreamError<ActivityError>) -> Self {
        match err {
            StreamError::Work(inner) => inner,
            StreamError::Panicked(msg) => ActivityError::Permanent(format!("record worker panicked: {msg}")),
            StreamError::Cancelled => ActivityError::Cancelled,
        }
    }
}

/// Job-specific work dispatched by the orchestrator.
///
/// `process` may run more than once for the same target (retries, and the
/// in-flight wave is re-attempted after a crash), so it must be idempotent
/// against the stores it mutates or pair with a `cleanup` that undoes it.
#[async_trait]
pub trait BatchActivity: Send + Sync {
    /// Stable job kind name, e.g. `"reindex"`.
    fn name(&self) -> &str;

    /// Process every record behind `target`, returning how many were handled.
    async fn process(
        &self,
        target: &BatchTarget,
        cancel: CancellationToken,
    ) -> Result<u64, ActivityError>;

    /// Best-effort compensation for a batch that failed permanently.
    async fn cleanup(&self, _target: &BatchTarget) -> Result<(), ActivityError> {
        Ok(())
    }

    /// Runs once, in the generation that finds no work left.
    async fn complete(&self, _cancel: CancellationToken) -> Result<(), ActivityError> {
        Ok(())
    }
}
