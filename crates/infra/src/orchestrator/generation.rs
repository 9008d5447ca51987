//! One execution generation: Planning → Dispatching → Checkpointing →
//! Continuing | Finalizing.
//!
//! Every decision is a function of the input checkpoint and the wave's
//! outcomes. The only side effects are the dispatched activities, catalog
//! reads for catalog-planned jobs, and the checkpoint/status writes. A host
//! that crashes mid-generation resumes from the last persisted checkpoint and
//! re-attempts the interrupted wave.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

use backfill_core::{BatchOutcome, Checkpoint, GenerationHandle, RuntimeStatus, Wave};
use backfill_observability::JobMetrics;

use super::OrchestrationError;
use super::dispatch::{WaveDispatcher, WaveInterrupted};
use crate::activity::BatchActivity;
use crate::checkpoint_store::CheckpointStore;
use crate::collaborators::WatermarkCatalog;
use crate::retry::{RetryError, RetryExecutor};

/// Shared dependencies of every generation a host runs.
#[derive(Clone)]
pub struct GenerationContext {
    pub store: Arc<dyn CheckpointStore>,
    pub catalog: Arc<dyn WatermarkCatalog>,
    pub dispatcher: Arc<dyn WaveDispatcher>,
    pub retry: RetryExecutor,
    pub metrics: Arc<JobMetrics>,
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The next generation's input was persisted under this handle.
    Continued(GenerationHandle),
    /// No work was left; the job reached this terminal status.
    Finished(RuntimeStatus),
    /// Cancelled before its wave settled. Nothing was persisted.
    Interrupted,
}

enum State {
    Planning,
    Dispatching(Wave),
    Checkpointing(Wave, Vec<BatchOutcome>),
    Finalizing(Checkpoint),
}

pub struct Generation {
    ctx: GenerationContext,
    activity: Arc<dyn BatchActivity>,
    handle: GenerationHandle,
    checkpoint: Checkpoint,
}

impl Generation {
    pub fn new(
        ctx: GenerationContext,
        activity: Arc<dyn BatchActivity>,
        handle: GenerationHandle,
        checkpoint: Checkpoint,
    ) -> Self {
        Self {
            ctx,
            activity,
            handle,
            checkpoint,
        }
    }

    pub fn handle(&self) -> GenerationHandle {
        self.handle
    }

    pub async fn run(self, cancel: &CancellationToken) -> Result<GenerationOutcome, OrchestrationError> {
        let span = info_span!(
            "generation",
            job_id = %self.handle.job_id,
            generation = self.handle.generation,
            kind = self.activity.name(),
        );
        self.drive(cancel).instrument(span).await
    }

    async fn drive(&self, cancel: &CancellationToken) -> Result<GenerationOutcome, OrchestrationError> {
        let mut state = State::Planning;
        loop {
            state = match state {
                State::Planning => match self.plan(cancel).await? {
                    None => return Ok(GenerationOutcome::Interrupted),
                    Some(wave) if wave.is_empty() => State::Finalizing(self.checkpoint.clone()),
                    Some(wave) => {
                        info!(batches = wave.batches.len(), "wave planned");
                        State::Dispatching(wave)
                    }
                },
                State::Dispatching(wave) => {
                    match self
                        .ctx
                        .dispatcher
                        .dispatch(Arc::clone(&self.activity), &wave.batches, cancel)
                        .await
                    {
                        Ok(outcomes) => State::Checkpointing(wave, outcomes),
                        Err(WaveInterrupted) => {
                            info!("wave interrupted, not checkpointed");
                            return Ok(GenerationOutcome::Interrupted);
                        }
                    }
                }
                State::Checkpointing(wave, outcomes) => {
                    let next = self.checkpoint.advance(&wave, &outcomes)?;
                    let failed = outcomes.iter().filter(|o| o.is_failure()).count();
                    let handle = self
                        .ctx
                        .store
                        .persist(self.handle.job_id, self.handle.next().generation, &next)
                        .await?;
                    info!(
                        next = %handle,
                        failed,
                        total_processed = next.total_processed,
                        errors = next.error_count(),
                        "checkpoint persisted"
                    );
                    if next.is_complete() {
                        State::Finalizing(next)
                    } else {
                        return Ok(GenerationOutcome::Continued(handle));
                    }
                }
                State::Finalizing(checkpoint) => return self.finalize(&checkpoint, cancel).await,
            };
        }
    }

    /// `None` when cancelled while asking the catalog.
    async fn plan(&self, cancel: &CancellationToken) -> Result<Option<Wave>, OrchestrationError> {
        let Some(plan) = self.checkpoint.catalog_plan() else {
            return Ok(Some(self.checkpoint.plan_wave()));
        };

        let catalog = &self.ctx.catalog;
        let candidates = self
            .ctx
            .retry
            .execute(cancel, move |_| {
                catalog.get_pending_batches(
                    plan.size,
                    plan.max_parallel,
                    plan.status,
                    Some(plan.upper_bound),
                )
            })
            .await;

        match candidates {
            Ok(candidates) => Ok(Some(self.checkpoint.plan_wave_from_candidates(&candidates))),
            Err(RetryError::Cancelled) => Ok(None),
            Err(err) => Err(OrchestrationError::Catalog(err.to_string())),
        }
    }

    /// Terminal step. Safe to repeat: the completion hook is idempotent and
    /// metrics are keyed by job.
    async fn finalize(
        &self,
        checkpoint: &Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, OrchestrationError> {
        let activity = &self.activity;
        let completed = self
            .ctx
            .retry
            .execute(cancel, move |_| activity.complete(cancel.child_token()))
            .await;
        match completed {
            Ok(()) => {}
            Err(RetryError::Cancelled) => return Ok(GenerationOutcome::Interrupted),
            Err(_) if cancel.is_cancelled() => return Ok(GenerationOutcome::Interrupted),
            Err(err) => return Err(OrchestrationError::Completion(err.to_string())),
        }

        let status = checkpoint.terminal_status();
        let job_key = self.handle.job_id.to_string();
        self.ctx.metrics.record_completion(
            &job_key,
            checkpoint.total_processed,
            checkpoint.error_count() as u64,
        );
        self.ctx
            .store
            .update_status(self.handle.job_id, status, None)
            .await?;

        info!(
            status = %status,
            total_processed = checkpoint.total_processed,
            errors = checkpoint.error_count(),
            "job finished"
        );
        Ok(GenerationOutcome::Finished(status))
    }
}
