//! Durable job records and per-generation checkpoints.
//!
//! One checkpoint row exists per `(job_id, generation)`. Checkpoints are
//! stored as JSON documents and decoded on load, so a document written by an
//! older build still loads as long as new fields carry `#[serde(default)]`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use backfill_core::{Checkpoint, GenerationHandle, JobId, RuntimeStatus};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;

/// Checkpoint store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt checkpoint {handle}: {reason}")]
    Corrupt {
        handle: GenerationHandle,
        reason: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Everything the host needs to resume a job, minus its checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    /// Registered job kind, e.g. `"reindex"`.
    pub kind: String,
    /// Kind-specific parameters used to rebuild the activity on resume.
    #[serde(default)]
    pub params: serde_json::Value,
    pub runtime_status: RuntimeStatus,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default)]
    pub latest_generation: u64,
    pub created_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job_id: JobId, kind: impl Into<String>, params: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            kind: kind.into(),
            params,
            runtime_status: RuntimeStatus::Running,
            failure: None,
            latest_generation: 0,
            created_time: now,
            last_updated_time: now,
        }
    }
}

/// Persistence facility for job records and generation checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Register a job together with its generation-0 checkpoint.
    async fn create_job(
        &self,
        record: JobRecord,
        initial: &Checkpoint,
    ) -> Result<GenerationHandle, CheckpointStoreError>;

    /// Store `checkpoint` as the input of `generation`. Writing the same
    /// generation again replaces it.
    async fn persist(
        &self,
        job_id: JobId,
        generation: u64,
        checkpoint: &Checkpoint,
    ) -> Result<GenerationHandle, CheckpointStoreError>;

    /// The highest persisted generation and its checkpoint.
    async fn load_latest(
        &self,
        job_id: JobId,
    ) -> Result<(GenerationHandle, Checkpoint), CheckpointStoreError>;

    async fn update_status(
        &self,
        job_id: JobId,
        status: RuntimeStatus,
        failure: Option<String>,
    ) -> Result<(), CheckpointStoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, CheckpointStoreError>;

    /// Jobs in `status` (all jobs when `None`), oldest first.
    async fn list_jobs(
        &self,
        status: Option<RuntimeStatus>,
    ) -> Result<Vec<JobRecord>, CheckpointStoreError>;
}

fn encode(handle: GenerationHandle, checkpoint: &Checkpoint) -> Result<serde_json::Value, CheckpointStoreError> {
    serde_json::to_value(checkpoint)
        .map_err(|e| CheckpointStoreError::Storage(format!("failed to encode checkpoint {handle}: {e}")))
}

fn decode(handle: GenerationHandle, value: serde_json::Value) -> Result<Checkpoint, CheckpointStoreError> {
    serde_json::from_value(value).map_err(|e| CheckpointStoreError::Corrupt {
        handle,
        reason: e.to_string(),
    })
}
