//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, invariants).
/// Storage and transport concerns belong to `backfill-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Bad batching, stream, retry or range options, or a malformed job id.
///
/// Always fatal: a job configured with one of these never starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid configuration: {field}: {reason}")]
pub struct ConfigurationError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigurationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl From<DomainError> for ConfigurationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidId(msg) => Self::new("job_id", msg),
            DomainError::Validation(msg) | DomainError::InvariantViolation(msg) => {
                Self::new("value", msg)
            }
        }
    }
}
