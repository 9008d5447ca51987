//! In-memory checkpoint store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use backfill_core::{Checkpoint, GenerationHandle, JobId, RuntimeStatus};

use super::{CheckpointStore, CheckpointStoreError, JobRecord, decode, encode};

/// Keeps checkpoints as JSON documents, like the durable store does.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    generations: RwLock<HashMap<JobId, BTreeMap<u64, serde_json::Value>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Replace a stored document verbatim, bypassing encoding.
    pub fn put_raw(&self, job_id: JobId, generation: u64, document: serde_json::Value) {
        self.generations
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(job_id)
            .or_default()
            .insert(generation, document);
    }

    /// Number of persisted generations of a job.
    pub fn generation_count(&self, job_id: JobId) -> usize {
        self.generations
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&job_id)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn create_job(
        &self,
        record: JobRecord,
        initial: &Checkpoint,
    ) -> Result<GenerationHandle, CheckpointStoreError> {
        let handle = GenerationHandle::initial(record.job_id);
        let document = encode(handle, initial)?;

        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        if jobs.contains_key(&record.job_id) {
            return Err(CheckpointStoreError::AlreadyExists(record.job_id));
        }
        let mut generations = self.generations.write().unwrap_or_else(|p| p.into_inner());
        generations
            .entry(record.job_id)
            .or_default()
            .insert(handle.generation, document);
        jobs.insert(record.job_id, record);
        Ok(handle)
    }

    async fn persist(
        &self,
        job_id: JobId,
        generation: u64,
        checkpoint: &Checkpoint,
    ) -> Result<GenerationHandle, CheckpointStoreError> {
        let handle = GenerationHandle { job_id, generation };
        let document = encode(handle, checkpoint)?;

        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        let record = jobs
            .get_mut(&job_id)
            .ok_or(CheckpointStoreError::NotFound(job_id))?;
        record.latest_generation = record.latest_generation.max(generation);
        record.last_updated_time = Utc::now();

        self.generations
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(job_id)
            .or_default()
            .insert(generation, document);
        Ok(handle)
    }

    async fn load_latest(
        &self,
        job_id: JobId,
    ) -> Result<(GenerationHandle, Checkpoint), CheckpointStoreError> {
        let (generation, document) = {
            let generations = self.generations.read().unwrap_or_else(|p| p.into_inner());
            let (generation, document) = generations
                .get(&job_id)
                .and_then(|g| g.last_key_value())
                .ok_or(CheckpointStoreError::NotFound(job_id))?;
            (*generation, document.clone())
        };
        let handle = GenerationHandle { job_id, generation };
        Ok((handle, decode(handle, document)?))
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: RuntimeStatus,
        failure: Option<String>,
    ) -> Result<(), CheckpointStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        let record = jobs
            .get_mut(&job_id)
            .ok_or(CheckpointStoreError::NotFound(job_id))?;
        record.runtime_status = status;
        record.failure = failure;
        record.last_updated_time = Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, CheckpointStoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&job_id)
            .cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<RuntimeStatus>,
    ) -> Result<Vec<JobRecord>, CheckpointStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(|p| p.into_inner());
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.runtime_status == s))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_time);
        Ok(result)
    }
}
