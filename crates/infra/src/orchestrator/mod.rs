//! The resumable control loop.
//!
//! One [`Generation`] turns one persisted checkpoint into either the next
//! persisted checkpoint or a terminal status. Nothing is carried in memory
//! from one generation to the next; the host loads each input from the
//! checkpoint store.

use thiserror::Error;

use backfill_core::{ConfigurationError, DomainError, JobId};

use crate::checkpoint_store::CheckpointStoreError;

pub mod dispatch;
pub mod generation;

pub use dispatch::{InProcessDispatcher, WaveDispatcher, WaveInterrupted};
pub use generation::{Generation, GenerationContext, GenerationOutcome};

/// Errors that abort a whole job (surfaced as `Failed`).
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("checkpoint store: {0}")]
    Store(String),

    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("catalog planning failed: {0}")]
    Catalog(String),

    #[error("completion step failed: {0}")]
    Completion(String),

    #[error("wave bookkeeping failed: {0}")]
    Invariant(#[from] DomainError),
}

impl From<CheckpointStoreError> for OrchestrationError {
    fn from(err: CheckpointStoreError) -> Self {
        match err {
            CheckpointStoreError::Corrupt { .. } => OrchestrationError::CorruptCheckpoint(err.to_string()),
            CheckpointStoreError::NotFound(job_id) => OrchestrationError::JobNotFound(job_id),
            other => OrchestrationError::Store(other.to_string()),
        }
    }
}
