//! Job progress snapshots.
//!
//! A [`Checkpoint`] is the whole input of one execution generation. It is
//! never mutated across generations: [`Checkpoint::advance`] produces the next
//! value from the current one plus the settled outcomes of a wave.
//!
//! ## Schema evolution
//!
//! Historical generations are read back on resume, so every field that is not
//! part of the original layout carries `#[serde(default)]`. New fields must do
//! the same.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batching::{BatchPlanner, BatchingOptions, Direction, PlanSource, PlannedWave};
use crate::error::{ConfigurationError, DomainError};
use crate::range::WatermarkRange;
use crate::status::RuntimeStatus;
use crate::unit::{BatchTarget, JobUnit};

/// Work a job still has to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RemainingWork {
    /// Range-mode: partition a watermark range.
    Range {
        remaining: Option<WatermarkRange>,
        #[serde(default)]
        direction: Direction,
        #[serde(default)]
        plan: PlanSource,
        /// The range the job started with (progress reporting only).
        #[serde(default)]
        scope: Option<WatermarkRange>,
    },
    /// List-mode: one entity per wave.
    Units {
        remaining: Vec<JobUnit>,
        #[serde(default)]
        total: usize,
    },
}

impl RemainingWork {
    pub fn is_empty(&self) -> bool {
        match self {
            RemainingWork::Range { remaining, .. } => remaining.is_none(),
            RemainingWork::Units { remaining, .. } => remaining.is_empty(),
        }
    }
}

/// A permanent batch failure, kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    pub target: BatchTarget,
    pub message: String,
}

/// How one dispatched batch settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Succeeded { target: BatchTarget, processed: u64 },
    Failed { target: BatchTarget, message: String },
}

impl BatchOutcome {
    pub fn target(&self) -> &BatchTarget {
        match self {
            BatchOutcome::Succeeded { target, .. } | BatchOutcome::Failed { target, .. } => target,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, BatchOutcome::Failed { .. })
    }
}

/// Batches to dispatch in one generation and the work left once they settle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    pub batches: Vec<BatchTarget>,
    pub next: RemainingWork,
}

impl Wave {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Serializable job progress snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub work: RemainingWork,
    pub batching: BatchingOptions,
    pub created_time: DateTime<Utc>,
    /// Append-only until the job finalizes.
    #[serde(default)]
    pub errors: Vec<BatchError>,
    #[serde(default)]
    pub total_processed: u64,
}

impl Checkpoint {
    /// Initial checkpoint of a range-mode job walking `range`.
    pub fn for_range(
        range: Option<WatermarkRange>,
        direction: Direction,
        batching: BatchingOptions,
        created_time: DateTime<Utc>,
    ) -> Self {
        Self {
            work: RemainingWork::Range {
                remaining: range,
                direction,
                plan: PlanSource::Arithmetic,
                scope: range,
            },
            batching,
            created_time,
            errors: Vec::new(),
            total_processed: 0,
        }
    }

    /// Initial checkpoint of a list-mode job over `units`.
    pub fn for_units(
        units: Vec<JobUnit>,
        batching: BatchingOptions,
        created_time: DateTime<Utc>,
    ) -> Self {
        let total = units.len();
        Self {
            work: RemainingWork::Units {
                remaining: units,
                total,
            },
            batching,
            created_time,
            errors: Vec::new(),
            total_processed: 0,
        }
    }

    /// Plan range-mode batches from catalog boundaries instead of arithmetic slices.
    ///
    /// Catalog queries look downward from a ceiling, so only descending jobs qualify.
    pub fn with_plan_source(mut self, source: PlanSource) -> Result<Self, ConfigurationError> {
        match &mut self.work {
            RemainingWork::Range {
                direction, plan, ..
            } => {
                if matches!(source, PlanSource::Catalog { .. }) && *direction != Direction::Descending {
                    return Err(ConfigurationError::new(
                        "plan",
                        "catalog planning requires a descending job",
                    ));
                }
                *plan = source;
                Ok(self)
            }
            RemainingWork::Units { .. } => Err(ConfigurationError::new(
                "plan",
                "plan sources only apply to range-mode jobs",
            )),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.work.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Catalog planning parameters, if this checkpoint plans from the catalog.
    pub fn catalog_plan(&self) -> Option<CatalogPlan> {
        match &self.work {
            RemainingWork::Range {
                remaining: Some(range),
                plan: PlanSource::Catalog { status },
                ..
            } => Some(CatalogPlan {
                size: self.batching.size(),
                max_parallel: self.batching.max_parallel_count(),
                status: *status,
                upper_bound: range.end(),
            }),
            _ => None,
        }
    }

    /// Plan the next wave without consulting any collaborator.
    ///
    /// Range-mode checkpoints that plan from the catalog must use
    /// [`Checkpoint::plan_wave_from_candidates`] instead.
    pub fn plan_wave(&self) -> Wave {
        match &self.work {
            RemainingWork::Range {
                remaining,
                direction,
                ..
            } => {
                let planned = BatchPlanner::plan(*remaining, &self.batching, *direction);
                self.range_wave(planned)
            }
            RemainingWork::Units { remaining, total } => match remaining.split_first() {
                None => Wave {
                    batches: Vec::new(),
                    next: self.work.clone(),
                },
                Some((head, rest)) => Wave {
                    batches: vec![BatchTarget::unit(head.clone())],
                    next: RemainingWork::Units {
                        remaining: rest.to_vec(),
                        total: *total,
                    },
                },
            },
        }
    }

    /// Plan the next range-mode wave from catalog-provided batch boundaries.
    pub fn plan_wave_from_candidates(&self, candidates: &[WatermarkRange]) -> Wave {
        match &self.work {
            RemainingWork::Range {
                remaining,
                direction,
                ..
            } => {
                let planned =
                    BatchPlanner::from_candidates(*remaining, candidates, &self.batching, *direction);
                self.range_wave(planned)
            }
            RemainingWork::Units { .. } => self.plan_wave(),
        }
    }

    fn range_wave(&self, planned: PlannedWave) -> Wave {
        let RemainingWork::Range {
            direction,
            plan,
            scope,
            ..
        } = &self.work
        else {
            return self.plan_wave();
        };
        Wave {
            batches: planned.batches.into_iter().map(BatchTarget::range).collect(),
            next: RemainingWork::Range {
                remaining: planned.remaining,
                direction: *direction,
                plan: *plan,
                scope: *scope,
            },
        }
    }

    /// Produce the checkpoint that follows `wave` once all its batches settled.
    ///
    /// Remaining work shrinks by every attempted batch, failed or not. Each
    /// batch must settle exactly once.
    pub fn advance(&self, wave: &Wave, outcomes: &[BatchOutcome]) -> Result<Checkpoint, DomainError> {
        if outcomes.len() != wave.batches.len() {
            return Err(DomainError::invariant(format!(
                "wave of {} batches settled with {} outcomes",
                wave.batches.len(),
                outcomes.len()
            )));
        }
        for batch in &wave.batches {
            let settled = outcomes.iter().filter(|o| o.target() == batch).count();
            if settled != 1 {
                return Err(DomainError::invariant(format!(
                    "{batch} settled {settled} times"
                )));
            }
        }

        let mut next = self.clone();
        next.work = wave.next.clone();
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Succeeded { processed, .. } => {
                    next.total_processed = next.total_processed.saturating_add(*processed);
                }
                BatchOutcome::Failed { target, message } => next.errors.push(BatchError {
                    target: target.clone(),
                    message: message.clone(),
                }),
            }
        }
        Ok(next)
    }

    /// Terminal status once no work remains.
    pub fn terminal_status(&self) -> RuntimeStatus {
        if self.errors.is_empty() {
            RuntimeStatus::Completed
        } else {
            RuntimeStatus::CompletedWithErrors
        }
    }

    /// Share of the job's original scope already attempted, in `[0, 100]`.
    pub fn percent_complete(&self) -> f64 {
        if self.is_complete() {
            return 100.0;
        }
        let (done, total) = match &self.work {
            RemainingWork::Range {
                remaining, scope, ..
            } => match scope {
                Some(scope) => {
                    let left = remaining.map(|r| r.len()).unwrap_or(0);
                    (scope.len().saturating_sub(left), scope.len())
                }
                None => (0, 0),
            },
            RemainingWork::Units { remaining, total } => (
                total.saturating_sub(remaining.len()) as u64,
                *total as u64,
            ),
        };
        if total == 0 {
            return 0.0;
        }
        (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Parameters for asking the catalog where the next batches are.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CatalogPlan {
    pub size: u64,
    pub max_parallel: usize,
    pub status: crate::unit::RecordStatus,
    pub upper_bound: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn range(start: u64, end: u64) -> WatermarkRange {
        WatermarkRange::new(start, end).unwrap()
    }

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn range_checkpoint(end: u64, size: u64, max_parallel: usize) -> Checkpoint {
        Checkpoint::for_range(
            WatermarkRange::up_to(end),
            Direction::Descending,
            BatchingOptions::new(size, max_parallel).unwrap(),
            created(),
        )
    }

    fn succeeded(target: &BatchTarget, processed: u64) -> BatchOutcome {
        BatchOutcome::Succeeded {
            target: target.clone(),
            processed,
        }
    }

    #[test]
    fn advance_consumes_every_attempted_batch() {
        let checkpoint = range_checkpoint(50, 5, 3);
        let wave = checkpoint.plan_wave();
        assert_eq!(wave.batches.len(), 3);

        let outcomes = vec![
            succeeded(&wave.batches[0], 5),
            BatchOutcome::Failed {
                target: wave.batches[1].clone(),
                message: "blob store unavailable".to_string(),
            },
            succeeded(&wave.batches[2], 4),
        ];
        let next = checkpoint.advance(&wave, &outcomes).unwrap();

        assert_eq!(
            next.work,
            RemainingWork::Range {
                remaining: Some(range(1, 35)),
                direction: Direction::Descending,
                plan: PlanSource::Arithmetic,
                scope: Some(range(1, 50)),
            }
        );
        assert_eq!(next.total_processed, 9);
        assert_eq!(next.errors.len(), 1);
        assert_eq!(next.errors[0].target, BatchTarget::range(range(41, 45)));
        assert_eq!(next.created_time, checkpoint.created_time);
        // The input value is untouched.
        assert!(checkpoint.errors.is_empty());
    }

    #[test]
    fn advance_rejects_missing_or_duplicate_outcomes() {
        let checkpoint = range_checkpoint(50, 5, 2);
        let wave = checkpoint.plan_wave();

        let missing = vec![succeeded(&wave.batches[0], 5)];
        assert!(checkpoint.advance(&wave, &missing).is_err());

        let duplicated = vec![succeeded(&wave.batches[0], 5), succeeded(&wave.batches[0], 5)];
        assert!(checkpoint.advance(&wave, &duplicated).is_err());
    }

    #[test]
    fn errors_only_grow_across_generations() {
        let mut checkpoint = range_checkpoint(20, 5, 2);
        let mut seen = 0;
        while !checkpoint.is_complete() {
            let wave = checkpoint.plan_wave();
            let outcomes: Vec<_> = wave
                .batches
                .iter()
                .map(|t| BatchOutcome::Failed {
                    target: t.clone(),
                    message: "nope".to_string(),
                })
                .collect();
            checkpoint = checkpoint.advance(&wave, &outcomes).unwrap();
            assert!(checkpoint.errors.len() > seen);
            seen = checkpoint.errors.len();
        }
        assert_eq!(seen, 4);
        assert_eq!(checkpoint.terminal_status(), RuntimeStatus::CompletedWithErrors);
    }

    #[test]
    fn list_mode_takes_one_unit_per_wave() {
        let checkpoint = Checkpoint::for_units(
            vec![JobUnit::new("1.2.3"), JobUnit::new("1.2.4")],
            BatchingOptions::default(),
            created(),
        );
        let wave = checkpoint.plan_wave();
        assert_eq!(wave.batches, vec![BatchTarget::unit(JobUnit::new("1.2.3"))]);

        let next = checkpoint
            .advance(&wave, &[succeeded(&wave.batches[0], 12)])
            .unwrap();
        assert_eq!(next.percent_complete(), 50.0);

        let wave = next.plan_wave();
        let last = next.advance(&wave, &[succeeded(&wave.batches[0], 3)]).unwrap();
        assert!(last.is_complete());
        assert!(last.plan_wave().is_empty());
        assert_eq!(last.total_processed, 15);
        assert_eq!(last.terminal_status(), RuntimeStatus::Completed);
    }

    #[test]
    fn percent_complete_tracks_the_scope() {
        let checkpoint = range_checkpoint(100, 10, 2);
        assert_eq!(checkpoint.percent_complete(), 0.0);

        let wave = checkpoint.plan_wave();
        let outcomes: Vec<_> = wave.batches.iter().map(|t| succeeded(t, 10)).collect();
        let next = checkpoint.advance(&wave, &outcomes).unwrap();
        assert_eq!(next.percent_complete(), 20.0);
    }

    #[test]
    fn catalog_planning_requires_descending_range_jobs() {
        let ascending = Checkpoint::for_range(
            WatermarkRange::up_to(10),
            Direction::Ascending,
            BatchingOptions::default(),
            created(),
        );
        assert!(ascending
            .with_plan_source(PlanSource::Catalog { status: Default::default() })
            .is_err());

        let descending = range_checkpoint(10, 5, 1)
            .with_plan_source(PlanSource::Catalog { status: Default::default() })
            .unwrap();
        let plan = descending.catalog_plan().unwrap();
        assert_eq!(plan.upper_bound, 10);
        assert_eq!(plan.size, 5);
    }

    #[test]
    fn older_checkpoints_without_new_fields_still_load() {
        let json = r#"{
            "work": {"mode": "range", "remaining": {"start": 1, "end": 40}},
            "batching": {"size": 10, "max_parallel_count": 2},
            "created_time": "2024-03-01T12:00:00Z"
        }"#;
        let checkpoint: Checkpoint = serde_json::from_str(json).unwrap();

        assert!(checkpoint.errors.is_empty());
        assert_eq!(checkpoint.total_processed, 0);
        let wave = checkpoint.plan_wave();
        assert_eq!(wave.batches[0], BatchTarget::range(range(31, 40)));
    }

    #[test]
    fn checkpoint_survives_a_json_round_trip() {
        let checkpoint = range_checkpoint(50, 5, 3);
        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
