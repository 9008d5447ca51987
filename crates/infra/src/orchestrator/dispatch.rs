//! Fan-out/fan-in of one wave of batch activities.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use backfill_core::{BatchOutcome, BatchTarget};

use crate::activity::BatchActivity;
use crate::retry::{RetryError, RetryExecutor};

/// The wave was cancelled before every batch settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wave interrupted before settling")]
pub struct WaveInterrupted;

/// Awaits a whole wave as a single operation.
#[async_trait]
pub trait WaveDispatcher: Send + Sync {
    /// Run every batch to settlement and return one outcome per batch.
    ///
    /// A failing batch never cancels its siblings. Cancellation discards the
    /// whole wave.
    async fn dispatch(
        &self,
        activity: Arc<dyn BatchActivity>,
        batches: &[BatchTarget],
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchOutcome>, WaveInterrupted>;
}

/// Runs every batch of a wave concurrently on the current runtime.
///
/// Wave size is already capped by `max_parallel_count`, so no further
/// limit is applied here.
#[derive(Debug, Clone, Default)]
pub struct InProcessDispatcher {
    retry: RetryExecutor,
}

impl InProcessDispatcher {
    pub fn new(retry: RetryExecutor) -> Self {
        Self { retry }
    }

    /// `None` when cancellation cut the batch short.
    async fn settle(
        &self,
        activity: &Arc<dyn BatchActivity>,
        target: &BatchTarget,
        cancel: &CancellationToken,
    ) -> Option<BatchOutcome> {
        let result = self
            .retry
            .execute(cancel, move |attempt| {
                debug!(attempt, "processing batch");
                activity.process(target, cancel.child_token())
            })
            .await;

        match result {
            Ok(processed) => Some(BatchOutcome::Succeeded {
                target: target.clone(),
                processed,
            }),
            Err(RetryError::Cancelled) => None,
            Err(_) if cancel.is_cancelled() => None,
            Err(err) => {
                warn!(error = %err, "batch failed permanently");
                if let Err(cleanup_err) = activity.cleanup(target).await {
                    warn!(error = %cleanup_err, "compensating cleanup failed");
                }
                Some(BatchOutcome::Failed {
                    target: target.clone(),
                    message: err.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl WaveDispatcher for InProcessDispatcher {
    async fn dispatch(
        &self,
        activity: Arc<dyn BatchActivity>,
        batches: &[BatchTarget],
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchOutcome>, WaveInterrupted> {
        let settled = join_all(batches.iter().map(|target| {
            self.settle(&activity, target, cancel)
                .instrument(info_span!("batch", batch = %target))
        }))
        .await;

        if cancel.is_cancelled() {
            return Err(WaveInterrupted);
        }
        settled.into_iter().collect::<Option<Vec<_>>>().ok_or(WaveInterrupted)
    }
}
