//! Wave planning: slicing a remaining watermark range into parallel batches.
//!
//! [`BatchPlanner::plan`] is a pure function of its inputs. The orchestrator
//! re-runs it when a generation is re-attempted after a crash, so the same
//! `(remaining, options, direction)` must always yield the same wave.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::range::WatermarkRange;
use crate::unit::RecordStatus;

/// Bounds on how a range is sliced per wave.
///
/// Invariants: `size > 0`, `max_parallel_count >= 1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BatchingRepr", into = "BatchingRepr")]
pub struct BatchingOptions {
    size: u64,
    max_parallel_count: usize,
}

#[derive(Serialize, Deserialize)]
struct BatchingRepr {
    size: u64,
    max_parallel_count: usize,
}

impl TryFrom<BatchingRepr> for BatchingOptions {
    type Error = ConfigurationError;

    fn try_from(value: BatchingRepr) -> Result<Self, Self::Error> {
        BatchingOptions::new(value.size, value.max_parallel_count)
    }
}

impl From<BatchingOptions> for BatchingRepr {
    fn from(value: BatchingOptions) -> Self {
        Self {
            size: value.size,
            max_parallel_count: value.max_parallel_count,
        }
    }
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self {
            size: 100,
            max_parallel_count: 5,
        }
    }
}

impl BatchingOptions {
    pub fn new(size: u64, max_parallel_count: usize) -> Result<Self, ConfigurationError> {
        if size == 0 {
            return Err(ConfigurationError::new(
                "batching.size",
                "must be greater than zero",
            ));
        }
        if max_parallel_count == 0 {
            return Err(ConfigurationError::new(
                "batching.max_parallel_count",
                "must be at least 1",
            ));
        }
        Ok(Self {
            size,
            max_parallel_count,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn max_parallel_count(&self) -> usize {
        self.max_parallel_count
    }

    /// Largest number of watermarks a single wave can claim.
    pub fn max_watermarks_per_wave(&self) -> u64 {
        self.size.saturating_mul(self.max_parallel_count as u64)
    }
}

/// Which end of the remaining range a job consumes first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Most recent watermarks first; the remaining ceiling moves down.
    #[default]
    Descending,
    /// Oldest watermarks first; the remaining floor moves up.
    Ascending,
}

/// Where range-mode batch boundaries come from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PlanSource {
    /// Fixed-size arithmetic slices of the remaining range.
    #[default]
    Arithmetic,
    /// Batches aligned to the records the catalog actually holds.
    Catalog {
        #[serde(default)]
        status: RecordStatus,
    },
}

/// Batches for one wave plus whatever is left afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWave {
    pub batches: Vec<WatermarkRange>,
    pub remaining: Option<WatermarkRange>,
}

impl PlannedWave {
    pub fn empty() -> Self {
        Self {
            batches: Vec::new(),
            remaining: None,
        }
    }

    /// Zero batches means the job has nothing left to do.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Pure batch planner.
#[derive(Debug, Copy, Clone, Default)]
pub struct BatchPlanner;

impl BatchPlanner {
    /// Slice up to `max_parallel_count` batches of at most `size` watermarks
    /// off the `direction` end of `remaining`.
    ///
    /// The last batch is clipped so it never leaves `remaining`.
    pub fn plan(
        remaining: Option<WatermarkRange>,
        options: &BatchingOptions,
        direction: Direction,
    ) -> PlannedWave {
        let Some(range) = remaining else {
            return PlannedWave::empty();
        };

        let span = options.size() - 1;
        let mut batches = Vec::with_capacity(options.max_parallel_count());

        match direction {
            Direction::Descending => {
                let mut ceiling = range.end();
                while batches.len() < options.max_parallel_count() {
                    let start = ceiling.saturating_sub(span).max(range.start());
                    batches.push(bounded(start, ceiling));
                    if start == range.start() {
                        return PlannedWave {
                            batches,
                            remaining: None,
                        };
                    }
                    ceiling = start - 1;
                }
                PlannedWave {
                    batches,
                    remaining: Some(bounded(range.start(), ceiling)),
                }
            }
            Direction::Ascending => {
                let mut floor = range.start();
                while batches.len() < options.max_parallel_count() {
                    let end = floor.saturating_add(span).min(range.end());
                    batches.push(bounded(floor, end));
                    if end == range.end() {
                        return PlannedWave {
                            batches,
                            remaining: None,
                        };
                    }
                    floor = end + 1;
                }
                PlannedWave {
                    batches,
                    remaining: Some(bounded(floor, range.end())),
                }
            }
        }
    }

    /// Build a wave from batch boundaries suggested by the catalog.
    ///
    /// Candidates are clipped to `remaining` and capped at
    /// `max_parallel_count`. Everything on the consumed side of the furthest
    /// claimed watermark is dropped from `remaining`; an empty candidate list
    /// means the catalog holds nothing more in range.
    pub fn from_candidates(
        remaining: Option<WatermarkRange>,
        candidates: &[WatermarkRange],
        options: &BatchingOptions,
        direction: Direction,
    ) -> PlannedWave {
        let Some(range) = remaining else {
            return PlannedWave::empty();
        };

        let mut batches: Vec<WatermarkRange> = candidates
            .iter()
            .filter_map(|c| c.intersect(&range))
            .collect();
        match direction {
            Direction::Descending => batches.sort_by(|a, b| b.end().cmp(&a.end())),
            Direction::Ascending => batches.sort_by_key(|b| b.start()),
        }
        batches.dedup_by(|a, b| !a.is_disjoint(b));
        batches.truncate(options.max_parallel_count());

        let remaining = match direction {
            Direction::Descending => batches
                .iter()
                .map(WatermarkRange::start)
                .min()
                .and_then(|lowest| range.below(lowest)),
            Direction::Ascending => batches
                .iter()
                .map(WatermarkRange::end)
                .max()
                .and_then(|highest| range.above(highest)),
        };

        PlannedWave { batches, remaining }
    }
}

// Both ends are always derived from an existing valid range.
fn bounded(start: u64, end: u64) -> WatermarkRange {
    WatermarkRange::from_bounds(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn range(start: u64, end: u64) -> WatermarkRange {
        WatermarkRange::new(start, end).unwrap()
    }

    fn options(size: u64, max_parallel: usize) -> BatchingOptions {
        BatchingOptions::new(size, max_parallel).unwrap()
    }

    #[test]
    fn descending_wave_from_the_top_of_the_range() {
        let wave = BatchPlanner::plan(Some(range(1, 50)), &options(5, 3), Direction::Descending);

        assert_eq!(wave.batches, vec![range(46, 50), range(41, 45), range(36, 40)]);
        assert_eq!(wave.remaining, Some(range(1, 35)));
    }

    #[test]
    fn ascending_wave_from_the_bottom_of_the_range() {
        let wave = BatchPlanner::plan(Some(range(1, 50)), &options(5, 3), Direction::Ascending);

        assert_eq!(wave.batches, vec![range(1, 5), range(6, 10), range(11, 15)]);
        assert_eq!(wave.remaining, Some(range(16, 50)));
    }

    #[test]
    fn empty_range_plans_nothing() {
        let wave = BatchPlanner::plan(None, &options(5, 3), Direction::Descending);
        assert!(wave.is_empty());
        assert_eq!(wave.remaining, None);

        let wave = BatchPlanner::plan(WatermarkRange::up_to(0), &options(5, 3), Direction::Descending);
        assert!(wave.is_empty());
    }

    #[test]
    fn range_smaller_than_size_is_a_single_short_batch() {
        let wave = BatchPlanner::plan(Some(range(7, 9)), &options(10, 4), Direction::Descending);
        assert_eq!(wave.batches, vec![range(7, 9)]);
        assert_eq!(wave.remaining, None);
    }

    #[test]
    fn last_batch_is_clipped_at_the_floor() {
        let wave = BatchPlanner::plan(Some(range(3, 14)), &options(5, 4), Direction::Descending);
        assert_eq!(wave.batches, vec![range(10, 14), range(5, 9), range(3, 4)]);
        assert_eq!(wave.remaining, None);
    }

    #[test]
    fn invalid_options_are_rejected() {
        assert!(BatchingOptions::new(0, 1).is_err());
        assert!(BatchingOptions::new(1, 0).is_err());
        assert!(serde_json::from_str::<BatchingOptions>(r#"{"size":0,"max_parallel_count":2}"#).is_err());
    }

    #[test]
    fn catalog_candidates_are_clipped_and_capped() {
        let candidates = [range(90, 120), range(60, 70), range(40, 45), range(10, 20)];
        let wave = BatchPlanner::from_candidates(
            Some(range(15, 100)),
            &candidates,
            &options(50, 3),
            Direction::Descending,
        );

        assert_eq!(wave.batches, vec![range(90, 100), range(60, 70), range(40, 45)]);
        assert_eq!(wave.remaining, Some(range(15, 39)));
    }

    #[test]
    fn no_catalog_candidates_means_done() {
        let wave = BatchPlanner::from_candidates(
            Some(range(1, 100)),
            &[],
            &options(50, 3),
            Direction::Descending,
        );
        assert!(wave.is_empty());
        assert_eq!(wave.remaining, None);
    }

    #[test]
    fn ascending_catalog_candidates_move_the_floor() {
        let candidates = [range(30, 39), range(5, 9)];
        let wave = BatchPlanner::from_candidates(
            Some(range(1, 100)),
            &candidates,
            &options(10, 1),
            Direction::Ascending,
        );
        assert_eq!(wave.batches, vec![range(5, 9)]);
        assert_eq!(wave.remaining, Some(range(10, 100)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: batches are disjoint, bounded by size and count, and
        /// cover exactly the highest min(S*M, N) watermarks.
        #[test]
        fn descending_batches_cover_the_top_of_the_range(
            n in 1u64..5_000,
            size in 1u64..200,
            max_parallel in 1usize..12,
        ) {
            let opts = options(size, max_parallel);
            let wave = BatchPlanner::plan(Some(range(1, n)), &opts, Direction::Descending);

            prop_assert!(wave.batches.len() <= max_parallel);
            for (i, a) in wave.batches.iter().enumerate() {
                prop_assert!(a.len() <= size);
                for b in wave.batches.iter().skip(i + 1) {
                    prop_assert!(a.is_disjoint(b));
                }
            }

            let covered: u64 = wave.batches.iter().map(WatermarkRange::len).sum();
            let expected = (size * max_parallel as u64).min(n);
            prop_assert_eq!(covered, expected);

            let lowest = wave.batches.iter().map(WatermarkRange::start).min().unwrap();
            prop_assert_eq!(lowest, n - expected + 1);
            prop_assert_eq!(wave.batches[0].end(), n);

            match wave.remaining {
                Some(rest) => {
                    prop_assert_eq!(rest.start(), 1);
                    prop_assert_eq!(rest.end(), lowest - 1);
                }
                None => prop_assert_eq!(lowest, 1),
            }
        }

        /// Property: repeatedly planning drains any range in disjoint waves.
        #[test]
        fn successive_waves_drain_the_range(
            start in 1u64..1_000,
            len in 1u64..3_000,
            size in 1u64..100,
            max_parallel in 1usize..6,
            ascending in any::<bool>(),
        ) {
            let direction = if ascending { Direction::Ascending } else { Direction::Descending };
            let opts = options(size, max_parallel);
            let mut remaining = Some(range(start, start + len - 1));
            let mut claimed: Vec<WatermarkRange> = Vec::new();

            while remaining.is_some() {
                let before = remaining.map(|r| r.len()).unwrap_or(0);
                let wave = BatchPlanner::plan(remaining, &opts, direction);
                prop_assert!(!wave.is_empty());
                for batch in &wave.batches {
                    prop_assert!(claimed.iter().all(|c| c.is_disjoint(batch)));
                }
                claimed.extend(wave.batches.iter().copied());
                remaining = wave.remaining;
                prop_assert!(remaining.map(|r| r.len()).unwrap_or(0) < before);
            }

            let total: u64 = claimed.iter().map(WatermarkRange::len).sum();
            prop_assert_eq!(total, len);
        }
    }
}
