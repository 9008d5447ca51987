//! Job host: the caller-facing surface of the engine.
//!
//! ## Design
//!
//! - `start_job` validates the request, persists the job record plus its
//!   generation-0 checkpoint, then drives generations on a background task
//! - Each generation's input is loaded from the checkpoint store, never
//!   carried over in memory, so `resume` after a restart runs exactly the
//!   same loop
//! - Every job gets a child of the host's shutdown token. `cancel` ends one
//!   job as `Canceled`; `shutdown` interrupts all of them and leaves them
//!   `Running` for a later `resume`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use backfill_core::{
    BatchError, BatchingOptions, Checkpoint, ConfigurationError, Direction, JobId, JobStatus,
    JobUnit, PlanSource, RuntimeStatus, WatermarkRange,
};
use backfill_observability::{JobMetrics, MetricsSnapshot};

use crate::activity::BatchActivity;
use crate::checkpoint_store::{CheckpointStore, CheckpointStoreError, JobRecord};
use crate::collaborators::{BlobStore, IndexStore, WatermarkCatalog};
use crate::config::EngineConfig;
use crate::jobs::{JobRegistry, WorkMode};
use crate::orchestrator::{
    Generation, GenerationContext, GenerationOutcome, InProcessDispatcher, OrchestrationError,
};
use crate::retry::RetryExecutor;

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// A request to start one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Registered job kind, e.g. `"reindex"`.
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub work: WorkSpec,
    /// Host defaults apply when absent.
    #[serde(default)]
    pub batching: Option<BatchingOptions>,
}

/// What a job iterates over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WorkSpec {
    Range {
        #[serde(default = "first_watermark")]
        start: u64,
        /// Highest watermark in the catalog when absent.
        #[serde(default)]
        end: Option<u64>,
        #[serde(default)]
        direction: Direction,
        #[serde(default)]
        plan: PlanSource,
    },
    Units {
        units: Vec<JobUnit>,
    },
}

fn first_watermark() -> u64 {
    1
}

impl WorkSpec {
    /// Everything from watermark 1 to the current catalog ceiling, newest first.
    pub fn everything() -> Self {
        WorkSpec::Range {
            start: first_watermark(),
            end: None,
            direction: Direction::Descending,
            plan: PlanSource::Arithmetic,
        }
    }

    fn mode(&self) -> WorkMode {
        match self {
            WorkSpec::Range { .. } => WorkMode::Range,
            WorkSpec::Units { .. } => WorkMode::Units,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} already finished as {status}")]
    AlreadyTerminal { job_id: JobId, status: RuntimeStatus },

    #[error("host is shutting down")]
    ShuttingDown,

    #[error("catalog unavailable: {0}")]
    Catalog(String),

    #[error(transparent)]
    Store(#[from] CheckpointStoreError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Host
// ─────────────────────────────────────────────────────────────────────────────

struct RunningJob {
    run_id: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct HostInner {
    ctx: GenerationContext,
    registry: JobRegistry,
    default_batching: BatchingOptions,
    shutdown: CancellationToken,
    running: Mutex<HashMap<JobId, RunningJob>>,
    next_run_id: AtomicU64,
}

/// Starts, observes, cancels and resumes batch jobs.
#[derive(Clone)]
pub struct JobHost {
    inner: Arc<HostInner>,
}

impl JobHost {
    pub fn new(ctx: GenerationContext, registry: JobRegistry, default_batching: BatchingOptions) -> Self {
        Self {
            inner: Arc::new(HostInner {
                ctx,
                registry,
                default_batching,
                shutdown: CancellationToken::new(),
                running: Mutex::new(HashMap::new()),
                next_run_id: AtomicU64::new(0),
            }),
        }
    }

    /// Host with the built-in job kinds wired to the given collaborators.
    pub fn from_config(
        config: &EngineConfig,
        store: Arc<dyn CheckpointStore>,
        catalog: Arc<dyn WatermarkCatalog>,
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn IndexStore>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let retry = RetryExecutor::new(config.retry.clone());
        let ctx = GenerationContext {
            store,
            catalog: Arc::clone(&catalog),
            dispatcher: Arc::new(InProcessDispatcher::new(retry.clone())),
            retry,
            metrics: Arc::new(JobMetrics::new()),
        };
        let registry = JobRegistry::standard(catalog, blobs, index, config.stream);
        Ok(Self::new(ctx, registry, config.batching))
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.ctx.metrics.snapshot()
    }

    /// Validate `spec`, persist the job and start running it.
    pub async fn start_job(&self, spec: JobSpec) -> Result<JobId, HostError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(HostError::ShuttingDown);
        }

        let kind = self
            .inner
            .registry
            .get(&spec.kind)
            .ok_or_else(|| HostError::UnknownJobKind(spec.kind.clone()))?;
        if kind.mode() != spec.work.mode() {
            return Err(ConfigurationError::new(
                "work",
                format!("{} jobs take {:?} work", kind.name(), kind.mode()),
            )
            .into());
        }
        let activity = kind.activity(&spec.params)?;

        let now = Utc::now();
        let batching = spec.batching.unwrap_or(self.inner.default_batching);
        let checkpoint = match spec.work {
            WorkSpec::Range {
                start,
                end,
                direction,
                plan,
            } => {
                let range = self.resolve_range(start, end).await?;
                Checkpoint::for_range(range, direction, batching, now).with_plan_source(plan)?
            }
            WorkSpec::Units { units } => Checkpoint::for_units(units, batching, now),
        };

        let job_id = JobId::new();
        let record = JobRecord::new(job_id, kind.name(), spec.params, now);
        self.inner.ctx.store.create_job(record, &checkpoint).await?;
        info!(job_id = %job_id, kind = kind.name(), "job started");

        self.spawn(job_id, activity);
        Ok(job_id)
    }

    async fn resolve_range(&self, start: u64, end: Option<u64>) -> Result<Option<WatermarkRange>, HostError> {
        if let Some(end) = end {
            return Ok(Some(WatermarkRange::new(start, end)?));
        }
        let ceiling = self
            .inner
            .ctx
            .retry
            .execute(&self.inner.shutdown, |_| self.inner.ctx.catalog.max_watermark())
            .await
            .map_err(|e| HostError::Catalog(e.to_string()))?;
        match ceiling {
            Some(ceiling) if ceiling >= start => Ok(Some(WatermarkRange::new(start, ceiling)?)),
            // Nothing stored at or above `start`: the job completes immediately.
            _ => Ok(None),
        }
    }

    /// Best-effort snapshot. A checkpoint that cannot be read still yields
    /// the job record's view.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatus, HostError> {
        let record = self.record(job_id).await?;
        let latest = match self.inner.ctx.store.load_latest(job_id).await {
            Ok(latest) => Some(latest),
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "status without checkpoint");
                None
            }
        };

        let (generation, percent_complete, error_count, total_processed) = match &latest {
            Some((handle, checkpoint)) => (
                handle.generation,
                checkpoint.percent_complete(),
                checkpoint.error_count(),
                checkpoint.total_processed,
            ),
            None => (record.latest_generation, 0.0, 0, 0),
        };

        Ok(JobStatus {
            job_id,
            kind: record.kind,
            runtime_status: record.runtime_status,
            percent_complete,
            error_count,
            total_processed,
            generation,
            created_time: record.created_time,
            last_updated_time: record.last_updated_time,
            failure: record.failure,
        })
    }

    /// Permanent batch failures recorded so far.
    pub async fn errors(&self, job_id: JobId) -> Result<Vec<BatchError>, HostError> {
        self.record(job_id).await?;
        let (_, checkpoint) = self.inner.ctx.store.load_latest(job_id).await?;
        Ok(checkpoint.errors)
    }

    /// Stop a job for good. The in-flight wave is discarded.
    ///
    /// Returns the job's final status, which is not `Canceled` when the job
    /// had already finished.
    pub async fn cancel(&self, job_id: JobId) -> Result<RuntimeStatus, HostError> {
        let record = self.record(job_id).await?;
        if record.runtime_status.is_terminal() {
            return Ok(record.runtime_status);
        }

        let running = self.running().remove(&job_id);
        if let Some(running) = running {
            running.cancel.cancel();
            wait_done(running.done).await;
        }

        // The last generation may have finished before the signal landed.
        let record = self.record(job_id).await?;
        if record.runtime_status.is_terminal() {
            return Ok(record.runtime_status);
        }

        self.inner
            .ctx
            .store
            .update_status(job_id, RuntimeStatus::Canceled, None)
            .await?;
        self.inner.ctx.metrics.record_cancellation(&job_id.to_string());
        info!(job_id = %job_id, "job canceled");
        Ok(RuntimeStatus::Canceled)
    }

    /// Continue a `Running` job from its last persisted checkpoint.
    /// Resuming a job that is already being driven is a no-op.
    pub async fn resume(&self, job_id: JobId) -> Result<(), HostError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(HostError::ShuttingDown);
        }
        let record = self.record(job_id).await?;
        if record.runtime_status.is_terminal() {
            return Err(HostError::AlreadyTerminal {
                job_id,
                status: record.runtime_status,
            });
        }
        if self.is_running(job_id) {
            return Ok(());
        }

        let activity = match self.rebuild_activity(&record) {
            Ok(activity) => activity,
            Err(err) => {
                self.inner.fail(job_id, &err).await;
                return Err(err.into());
            }
        };
        info!(job_id = %job_id, kind = %record.kind, "job resumed");
        self.spawn(job_id, activity);
        Ok(())
    }

    /// Resume every job a previous host left `Running`.
    pub async fn resume_all(&self) -> Result<Vec<JobId>, HostError> {
        let mut resumed = Vec::new();
        for record in self.inner.ctx.store.list_jobs(Some(RuntimeStatus::Running)).await? {
            match self.resume(record.job_id).await {
                Ok(()) => resumed.push(record.job_id),
                Err(err) => warn!(job_id = %record.job_id, error = %err, "job not resumed"),
            }
        }
        Ok(resumed)
    }

    /// Wait until the host stops driving `job_id`, then report its status.
    pub async fn wait(&self, job_id: JobId) -> Result<JobStatus, HostError> {
        let done = self.running().get(&job_id).map(|r| r.done.clone());
        if let Some(done) = done {
            wait_done(done).await;
        }
        self.get_status(job_id).await
    }

    /// Interrupt every job without recording a terminal status. Waves in
    /// flight are discarded; the jobs stay `Running`.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let running: Vec<RunningJob> = self.running().drain().map(|(_, r)| r).collect();
        info!(jobs = running.len(), "host shutting down");
        for job in running {
            wait_done(job.done).await;
        }
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running()
            .get(&job_id)
            .is_some_and(|r| !*r.done.borrow())
    }

    fn rebuild_activity(&self, record: &JobRecord) -> Result<Arc<dyn BatchActivity>, OrchestrationError> {
        let kind = self
            .inner
            .registry
            .get(&record.kind)
            .ok_or_else(|| OrchestrationError::UnknownJobKind(record.kind.clone()))?;
        Ok(kind.activity(&record.params)?)
    }

    fn spawn(&self, job_id: JobId, activity: Arc<dyn BatchActivity>) {
        let cancel = self.inner.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("job", job_id = %job_id, kind = activity.name());

        // Registered under the lock so the task cannot deregister first.
        let mut running = self.running();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        tokio::spawn(
            async move {
                inner.drive(job_id, activity, &token).await;
                inner.forget(job_id, run_id);
                let _ = done_tx.send(true);
            }
            .instrument(span),
        );
        running.insert(
            job_id,
            RunningJob {
                run_id,
                cancel,
                done: done_rx,
            },
        );
    }

    async fn record(&self, job_id: JobId) -> Result<JobRecord, HostError> {
        self.inner
            .ctx
            .store
            .get_job(job_id)
            .await?
            .ok_or(HostError::NotFound(job_id))
    }

    fn running(&self) -> MutexGuard<'_, HashMap<JobId, RunningJob>> {
        self.inner.running()
    }
}

impl HostInner {
    fn running(&self) -> MutexGuard<'_, HashMap<JobId, RunningJob>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn forget(&self, job_id: JobId, run_id: u64) {
        let mut running = self.running();
        if running.get(&job_id).is_some_and(|r| r.run_id == run_id) {
            running.remove(&job_id);
        }
    }

    /// Run generations until the job finishes, fails or is interrupted.
    async fn drive(&self, job_id: JobId, activity: Arc<dyn BatchActivity>, cancel: &CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                info!("job interrupted");
                return;
            }

            let (handle, checkpoint) = match self.ctx.store.load_latest(job_id).await {
                Ok(latest) => latest,
                Err(err) => {
                    self.fail(job_id, &OrchestrationError::from(err)).await;
                    return;
                }
            };

            let generation = Generation::new(self.ctx.clone(), Arc::clone(&activity), handle, checkpoint);
            match generation.run(cancel).await {
                Ok(GenerationOutcome::Continued(_)) => {}
                Ok(GenerationOutcome::Finished(_)) => return,
                Ok(GenerationOutcome::Interrupted) => {
                    info!(generation = handle.generation, "job interrupted");
                    return;
                }
                Err(err) => {
                    self.fail(job_id, &err).await;
                    return;
                }
            }
        }
    }

    async fn fail(&self, job_id: JobId, err: &OrchestrationError) {
        error!(job_id = %job_id, error = %err, "job failed");
        if let Err(store_err) = self
            .ctx
            .store
            .update_status(job_id, RuntimeStatus::Failed, Some(err.to_string()))
            .await
        {
            error!(job_id = %job_id, error = %store_err, "failed to record job failure");
        }
        self.ctx.metrics.record_failure(&job_id.to_string());
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    // A dropped sender means the task is gone as well.
    let _ = done.wait_for(|finished| *finished).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::checkpoint_store::InMemoryCheckpointStore;
    use crate::collaborators::{InMemoryBlobStore, InMemoryCatalog, InMemoryIndexStore};

    fn host(catalog: Arc<InMemoryCatalog>) -> JobHost {
        JobHost::from_config(
            &EngineConfig::default(),
            InMemoryCheckpointStore::arc(),
            catalog,
            InMemoryBlobStore::arc(),
            InMemoryIndexStore::arc(),
        )
        .unwrap()
    }

    fn reindex(work: WorkSpec) -> JobSpec {
        JobSpec {
            kind: "reindex".to_string(),
            params: serde_json::json!({"tags": ["00100010"]}),
            work,
            batching: None,
        }
    }

    #[tokio::test]
    async fn unknown_kinds_never_start() {
        let host = host(InMemoryCatalog::arc());
        let spec = JobSpec {
            kind: "defragment".to_string(),
            ..reindex(WorkSpec::everything())
        };
        assert!(matches!(host.start_job(spec).await, Err(HostError::UnknownJobKind(_))));
    }

    #[tokio::test]
    async fn work_must_match_the_kind() {
        let host = host(InMemoryCatalog::arc());
        let spec = reindex(WorkSpec::Units {
            units: vec![JobUnit::new("1.2.840.1")],
        });
        assert!(matches!(host.start_job(spec).await, Err(HostError::Configuration(_))));
    }

    #[tokio::test]
    async fn inverted_ranges_are_rejected() {
        let host = host(InMemoryCatalog::arc());
        let spec = reindex(WorkSpec::Range {
            start: 10,
            end: Some(3),
            direction: Direction::Descending,
            plan: PlanSource::Arithmetic,
        });
        assert!(matches!(host.start_job(spec).await, Err(HostError::Configuration(_))));
    }

    #[tokio::test]
    async fn empty_catalog_completes_immediately() {
        let host = host(InMemoryCatalog::arc());
        let job_id = host.start_job(reindex(WorkSpec::everything())).await.unwrap();

        let status = host.wait(job_id).await.unwrap();
        assert_eq!(status.runtime_status, RuntimeStatus::Completed);
        assert_eq!(status.percent_complete, 100.0);
        assert_eq!(status.generation, 0);
    }

    #[tokio::test]
    async fn unknown_jobs_are_not_found() {
        let host = host(InMemoryCatalog::arc());
        let job_id = JobId::new();
        assert!(matches!(host.get_status(job_id).await, Err(HostError::NotFound(_))));
        assert!(matches!(host.cancel(job_id).await, Err(HostError::NotFound(_))));
        assert!(matches!(host.resume(job_id).await, Err(HostError::NotFound(_))));
    }

    #[tokio::test]
    async fn shut_down_hosts_refuse_new_jobs() {
        let host = host(InMemoryCatalog::arc());
        host.shutdown().await;
        assert!(matches!(
            host.start_job(reindex(WorkSpec::everything())).await,
            Err(HostError::ShuttingDown)
        ));
    }
}
