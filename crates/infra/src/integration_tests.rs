//! End-to-end host scenarios.
//!
//! Tests: JobHost → Generation → WaveDispatcher → BatchActivity → collaborators
//!
//! Verifies:
//! - Jobs run across several generations and finish exactly once
//! - A failing batch is recorded once, cleaned up once, and never stops its siblings
//! - Jobs resume from the last persisted checkpoint after a crash or shutdown
//! - Cancellation discards the in-flight wave

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use backfill_core::{
        BatchOutcome, BatchTarget, BatchingOptions, Checkpoint, ConfigurationError, Direction, JobId,
        JobUnit, PlanSource, RuntimeStatus, WatermarkRange,
    };
    use backfill_observability::JobMetrics;

    use crate::activity::{ActivityError, BatchActivity};
    use crate::checkpoint_store::{CheckpointStore, InMemoryCheckpointStore, JobRecord};
    use crate::collaborators::{Fault, InMemoryBlobStore, InMemoryCatalog, InMemoryIndexStore, Metadata};
    use crate::host::{HostError, JobHost, JobSpec, WorkSpec};
    use crate::jobs::{JobKind, JobRegistry, WorkMode};
    use crate::orchestrator::{GenerationContext, InProcessDispatcher};
    use crate::retry::{RetryExecutor, RetryPolicy};
    use crate::stream::StreamOptions;

    /// Range activity that records what it saw.
    #[derive(Default)]
    struct Probe {
        /// Batches starting at one of these fail permanently.
        fail_starts: Vec<u64>,
        /// Hold every batch until cancelled.
        block: bool,
        started: Notify,
        processed: Mutex<Vec<BatchTarget>>,
        cleanups: Mutex<Vec<BatchTarget>>,
    }

    impl Probe {
        fn arc() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing(starts: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                fail_starts: starts.to_vec(),
                ..Self::default()
            })
        }

        fn blocking() -> Arc<Self> {
            Arc::new(Self {
                block: true,
                ..Self::default()
            })
        }

        fn processed(&self) -> Vec<BatchTarget> {
            let mut processed = self.processed.lock().unwrap().clone();
            processed.sort_by_key(|t| t.as_range().map(|r| r.start()));
            processed
        }
    }

    #[async_trait]
    impl BatchActivity for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        async fn process(&self, target: &BatchTarget, cancel: CancellationToken) -> Result<u64, ActivityError> {
            if self.block {
                self.started.notify_one();
                cancel.cancelled().await;
                return Err(ActivityError::Cancelled);
            }
            let range = target.as_range().copied().unwrap();
            if self.fail_starts.contains(&range.start()) {
                return Err(ActivityError::permanent(format!("refused {range}")));
            }
            self.processed.lock().unwrap().push(target.clone());
            Ok(range.len())
        }

        async fn cleanup(&self, target: &BatchTarget) -> Result<(), ActivityError> {
            self.cleanups.lock().unwrap().push(target.clone());
            Ok(())
        }
    }

    struct ProbeKind(Arc<Probe>);

    impl JobKind for ProbeKind {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn mode(&self) -> WorkMode {
            WorkMode::Range
        }

        fn activity(&self, _params: &serde_json::Value) -> Result<Arc<dyn BatchActivity>, ConfigurationError> {
            Ok(self.0.clone())
        }
    }

    struct Harness {
        store: Arc<InMemoryCheckpointStore>,
        catalog: Arc<InMemoryCatalog>,
        blobs: Arc<InMemoryBlobStore>,
        index: Arc<InMemoryIndexStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: InMemoryCheckpointStore::arc(),
                catalog: InMemoryCatalog::arc(),
                blobs: InMemoryBlobStore::arc(),
                index: InMemoryIndexStore::arc(),
            }
        }

        /// A fresh host over the same stores, as after a process restart.
        fn host(&self, probe: Arc<Probe>) -> JobHost {
            let retry = RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(1)));
            let ctx = GenerationContext {
                store: self.store.clone(),
                catalog: self.catalog.clone(),
                dispatcher: Arc::new(InProcessDispatcher::new(retry.clone())),
                retry,
                metrics: Arc::new(JobMetrics::new()),
            };
            let mut registry = JobRegistry::standard(
                self.catalog.clone(),
                self.blobs.clone(),
                self.index.clone(),
                StreamOptions::new(2, 4).unwrap(),
            );
            registry.register(Arc::new(ProbeKind(probe)));
            JobHost::new(ctx, registry, BatchingOptions::new(5, 2).unwrap())
        }
    }

    fn probe_job(end: u64) -> JobSpec {
        JobSpec {
            kind: "probe".to_string(),
            params: serde_json::Value::Null,
            work: WorkSpec::Range {
                start: 1,
                end: Some(end),
                direction: Direction::Descending,
                plan: PlanSource::Arithmetic,
            },
            batching: None,
        }
    }

    fn reindex_job() -> JobSpec {
        JobSpec {
            kind: "reindex".to_string(),
            params: serde_json::json!({"tags": ["00100010"]}),
            work: WorkSpec::everything(),
            batching: None,
        }
    }

    fn range(start: u64, end: u64) -> BatchTarget {
        BatchTarget::range(WatermarkRange::new(start, end).unwrap())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Full runs
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reindex_runs_across_generations() {
        let h = Harness::new();
        h.catalog.seed(1, 23);
        let host = h.host(Probe::arc());

        let job_id = host.start_job(reindex_job()).await.unwrap();
        let status = host.wait(job_id).await.unwrap();

        assert_eq!(status.runtime_status, RuntimeStatus::Completed);
        assert_eq!(status.generation, 3);
        assert_eq!(status.total_processed, 23);
        assert_eq!(status.percent_complete, 100.0);
        assert_eq!(h.index.indexed().len(), 23);
        assert_eq!(h.index.completed_tag_sets(), vec![vec!["00100010".to_string()]]);

        let metrics = host.metrics();
        assert_eq!(metrics.jobs_completed, 1);
        assert_eq!(metrics.records_processed, 23);
    }

    #[tokio::test]
    async fn catalog_planned_migration_follows_stored_records() {
        let h = Harness::new();
        h.catalog.seed(2, 4);
        let host = h.host(Probe::arc());

        let spec = JobSpec {
            kind: "migrate_frames".to_string(),
            params: serde_json::Value::Null,
            work: WorkSpec::Range {
                start: 1,
                end: None,
                direction: Direction::Descending,
                plan: PlanSource::Catalog {
                    status: backfill_core::RecordStatus::Created,
                },
            },
            batching: Some(BatchingOptions::new(3, 2).unwrap()),
        };
        let job_id = host.start_job(spec).await.unwrap();
        let status = host.wait(job_id).await.unwrap();

        assert_eq!(status.runtime_status, RuntimeStatus::Completed);
        assert_eq!(h.blobs.migrated_frames(), (1..=8).collect::<Vec<_>>());
        assert_eq!(h.blobs.frame_copies(), 8);
    }

    #[tokio::test]
    async fn metadata_update_walks_one_study_per_wave() {
        let h = Harness::new();
        for record in h.catalog.seed(3, 2) {
            let metadata = Metadata::from([("00080050".to_string(), "A1".to_string())]);
            h.blobs.put_metadata(&record.instance_uid, record.watermark, metadata);
        }
        // First instance of the second study cannot be read.
        h.blobs.inject_fault(3, Fault::Permanent);
        let host = h.host(Probe::arc());

        let spec = JobSpec {
            kind: "update_metadata".to_string(),
            params: serde_json::json!({"changes": {"00080050": "B2"}}),
            work: WorkSpec::Units {
                units: ["1.2.840.1", "1.2.840.2", "1.2.840.3"].map(JobUnit::new).to_vec(),
            },
            batching: None,
        };
        let job_id = host.start_job(spec).await.unwrap();
        let status = host.wait(job_id).await.unwrap();

        assert_eq!(status.runtime_status, RuntimeStatus::CompletedWithErrors);
        assert_eq!(status.generation, 3);
        let errors = host.errors(job_id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].target, BatchTarget::unit(JobUnit::new("1.2.840.2")));

        for record in h.catalog.records() {
            let versions = h.blobs.metadata_versions(&record.instance_uid);
            if record.study_uid == "1.2.840.2" {
                // Untouched: original version only, still current.
                assert_eq!(versions, vec![record.watermark]);
            } else {
                assert_eq!(versions.last(), Some(&record.watermark));
                let metadata = h.blobs.metadata(&record.instance_uid, record.watermark).unwrap();
                assert_eq!(metadata["00080050"], "B2");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Failures
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_batch_is_recorded_once_and_cleaned_up_once() {
        let h = Harness::new();
        let probe = Probe::failing(&[11]);
        let host = h.host(probe.clone());

        let job_id = host.start_job(probe_job(20)).await.unwrap();
        let status = host.wait(job_id).await.unwrap();

        assert_eq!(status.runtime_status, RuntimeStatus::CompletedWithErrors);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.total_processed, 15);
        assert_eq!(probe.processed(), vec![range(1, 5), range(6, 10), range(16, 20)]);
        assert_eq!(*probe.cleanups.lock().unwrap(), vec![range(11, 15)]);

        let errors = host.errors(job_id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].target, range(11, 15));

        let metrics = host.metrics();
        assert_eq!(metrics.jobs_completed_with_errors, 1);
        assert_eq!(metrics.batches_failed, 1);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_fails_the_job() {
        let h = Harness::new();
        let job_id = JobId::new();
        let initial = Checkpoint::for_range(
            WatermarkRange::up_to(20),
            Direction::Descending,
            BatchingOptions::new(5, 2).unwrap(),
            Utc::now(),
        );
        h.store
            .create_job(JobRecord::new(job_id, "probe", serde_json::Value::Null, Utc::now()), &initial)
            .await
            .unwrap();
        h.store.put_raw(job_id, 1, serde_json::json!({"work": "garbage"}));

        let host = h.host(Probe::arc());
        host.resume(job_id).await.unwrap();
        let status = host.wait(job_id).await.unwrap();

        assert_eq!(status.runtime_status, RuntimeStatus::Failed);
        assert!(status.failure.unwrap().contains("corrupt checkpoint"));
        assert_eq!(host.metrics().jobs_failed, 1);
        assert!(matches!(
            host.resume(job_id).await,
            Err(HostError::AlreadyTerminal { .. })
        ));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Resumption
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn restarted_host_resumes_from_the_last_checkpoint() {
        let h = Harness::new();
        let job_id = JobId::new();
        let initial = Checkpoint::for_range(
            WatermarkRange::up_to(30),
            Direction::Descending,
            BatchingOptions::new(5, 4).unwrap(),
            Utc::now(),
        );
        h.store
            .create_job(JobRecord::new(job_id, "probe", serde_json::Value::Null, Utc::now()), &initial)
            .await
            .unwrap();

        // A previous host settled the first wave, persisted generation 1,
        // then crashed.
        let wave = initial.plan_wave();
        let outcomes: Vec<_> = wave
            .batches
            .iter()
            .map(|target| BatchOutcome::Succeeded {
                target: target.clone(),
                processed: 5,
            })
            .collect();
        let next = initial.advance(&wave, &outcomes).unwrap();
        h.store.persist(job_id, 1, &next).await.unwrap();

        let probe = Probe::arc();
        let host = h.host(probe.clone());
        assert_eq!(host.resume_all().await.unwrap(), vec![job_id]);
        let status = host.wait(job_id).await.unwrap();

        assert_eq!(status.runtime_status, RuntimeStatus::Completed);
        assert_eq!(status.total_processed, 30);
        assert_eq!(probe.processed(), vec![range(1, 5), range(6, 10)]);
    }

    #[tokio::test]
    async fn shutdown_leaves_jobs_resumable() {
        let h = Harness::new();
        let blocking = Probe::blocking();
        let first = h.host(blocking.clone());

        let job_id = first.start_job(probe_job(20)).await.unwrap();
        blocking.started.notified().await;
        first.shutdown().await;

        let status = first.get_status(job_id).await.unwrap();
        assert_eq!(status.runtime_status, RuntimeStatus::Running);
        assert_eq!(h.store.generation_count(job_id), 1);

        let probe = Probe::arc();
        let second = h.host(probe.clone());
        second.resume(job_id).await.unwrap();
        let status = second.wait(job_id).await.unwrap();

        assert_eq!(status.runtime_status, RuntimeStatus::Completed);
        assert_eq!(
            probe.processed(),
            vec![range(1, 5), range(6, 10), range(11, 15), range(16, 20)]
        );
    }

    #[tokio::test]
    async fn cancel_discards_the_wave_in_flight() {
        let h = Harness::new();
        let blocking = Probe::blocking();
        let host = h.host(blocking.clone());

        let job_id = host.start_job(probe_job(20)).await.unwrap();
        blocking.started.notified().await;

        assert_eq!(host.cancel(job_id).await.unwrap(), RuntimeStatus::Canceled);
        assert!(!host.is_running(job_id));
        assert_eq!(h.store.generation_count(job_id), 1);
        assert!(blocking.cleanups.lock().unwrap().is_empty());

        let status = host.get_status(job_id).await.unwrap();
        assert_eq!(status.runtime_status, RuntimeStatus::Canceled);
        assert_eq!(status.error_count, 0);
        assert_eq!(host.metrics().jobs_canceled, 1);

        // Cancelling again reports the settled status.
        assert_eq!(host.cancel(job_id).await.unwrap(), RuntimeStatus::Canceled);
        assert_eq!(host.metrics().jobs_canceled, 1);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Replay
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn replaying_the_same_work_leaves_the_same_index() {
        let h = Harness::new();
        h.catalog.seed(2, 6);
        let host = h.host(Probe::arc());

        let first = host.start_job(reindex_job()).await.unwrap();
        host.wait(first).await.unwrap();
        let once = h.index.indexed();

        let second = host.start_job(reindex_job()).await.unwrap();
        let status = host.wait(second).await.unwrap();

        assert_eq!(status.runtime_status, RuntimeStatus::Completed);
        assert_eq!(h.index.indexed(), once);
        assert_eq!(h.index.completed_tag_sets().len(), 1);
    }

    #[tokio::test]
    async fn replaying_a_metadata_update_keeps_the_published_versions() {
        let h = Harness::new();
        for record in h.catalog.seed(2, 3) {
            let metadata = Metadata::from([("00080050".to_string(), "A1".to_string())]);
            h.blobs.put_metadata(&record.instance_uid, record.watermark, metadata);
        }
        let host = h.host(Probe::arc());
        let job = || JobSpec {
            kind: "update_metadata".to_string(),
            params: serde_json::json!({"changes": {"00080050": "B2"}}),
            work: WorkSpec::Units {
                units: ["1.2.840.1", "1.2.840.2"].map(JobUnit::new).to_vec(),
            },
            batching: None,
        };

        let first = host.start_job(job()).await.unwrap();
        host.wait(first).await.unwrap();
        let once = h.catalog.records();
        let versions_once: Vec<_> = once.iter().map(|r| h.blobs.metadata_versions(&r.instance_uid)).collect();

        let second = host.start_job(job()).await.unwrap();
        let status = host.wait(second).await.unwrap();

        assert_eq!(status.runtime_status, RuntimeStatus::Completed);
        assert_eq!(status.total_processed, 6);
        assert_eq!(h.catalog.records(), once);
        let versions_twice: Vec<_> = once.iter().map(|r| h.blobs.metadata_versions(&r.instance_uid)).collect();
        assert_eq!(versions_twice, versions_once);
    }
}
