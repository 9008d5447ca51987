//! Counters that tolerate re-executed terminal steps.
//!
//! A job's final generation can run more than once (a crash after the
//! counters were bumped but before the terminal status was persisted re-runs
//! it). Every increment therefore names the logical event it accounts for, and
//! a counter adds each event at most once.
//!
//! A counter remembers the most recent [`DEFAULT_RETAINED_EVENTS`] keys and
//! forgets the oldest beyond that. A terminal step only re-runs shortly after
//! its first run, so only recent keys need to be remembered.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Event keys each counter remembers.
pub const DEFAULT_RETAINED_EVENTS: usize = 10_000;

#[derive(Debug, Default)]
struct SeenEvents {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

/// Monotonic counter, incremented at most once per logical event key.
#[derive(Debug)]
pub struct ReplaySafeCounter {
    name: &'static str,
    value: AtomicU64,
    seen: Mutex<SeenEvents>,
    retained: usize,
}

impl ReplaySafeCounter {
    pub fn new(name: &'static str) -> Self {
        Self::with_retention(name, DEFAULT_RETAINED_EVENTS)
    }

    /// Counter remembering at most `retained` event keys (at least one).
    pub fn with_retention(name: &'static str, retained: usize) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
            seen: Mutex::new(SeenEvents::default()),
            retained: retained.max(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add `by` on behalf of `event_key`. Returns `false` (and adds nothing)
    /// when the event was already counted.
    pub fn add_once(&self, event_key: &str, by: u64) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        if !seen.keys.insert(event_key.to_string()) {
            ::tracing::debug!(counter = self.name, event = event_key, "duplicate increment ignored");
            return false;
        }
        seen.order.push_back(event_key.to_string());
        while seen.order.len() > self.retained {
            if let Some(oldest) = seen.order.pop_front() {
                seen.keys.remove(&oldest);
            }
        }
        self.value.fetch_add(by, Ordering::Relaxed);
        true
    }

    /// Event keys currently remembered.
    pub fn retained_events(&self) -> usize {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).keys.len()
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of [`JobMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_completed: u64,
    pub jobs_completed_with_errors: u64,
    pub jobs_failed: u64,
    pub jobs_canceled: u64,
    pub records_processed: u64,
    pub batches_failed: u64,
}

/// Terminal-step counters for batch jobs.
#[derive(Debug)]
pub struct JobMetrics {
    jobs_completed: ReplaySafeCounter,
    jobs_completed_with_errors: ReplaySafeCounter,
    jobs_failed: ReplaySafeCounter,
    jobs_canceled: ReplaySafeCounter,
    records_processed: ReplaySafeCounter,
    batches_failed: ReplaySafeCounter,
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl JobMetrics {
    pub fn new() -> Self {
        Self {
            jobs_completed: ReplaySafeCounter::new("jobs_completed"),
            jobs_completed_with_errors: ReplaySafeCounter::new("jobs_completed_with_errors"),
            jobs_failed: ReplaySafeCounter::new("jobs_failed"),
            jobs_canceled: ReplaySafeCounter::new("jobs_canceled"),
            records_processed: ReplaySafeCounter::new("records_processed"),
            batches_failed: ReplaySafeCounter::new("batches_failed"),
        }
    }

    /// Account for a job that attempted all of its work.
    pub fn record_completion(&self, job_key: &str, records: u64, failed_batches: u64) {
        if failed_batches == 0 {
            self.jobs_completed.add_once(job_key, 1);
        } else {
            self.jobs_completed_with_errors.add_once(job_key, 1);
        }
        self.records_processed.add_once(job_key, records);
        self.batches_failed.add_once(job_key, failed_batches);
    }

    pub fn record_failure(&self, job_key: &str) {
        self.jobs_failed.add_once(job_key, 1);
    }

    pub fn record_cancellation(&self, job_key: &str) {
        self.jobs_canceled.add_once(job_key, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_completed: self.jobs_completed.value(),
            jobs_completed_with_errors: self.jobs_completed_with_errors.value(),
            jobs_failed: self.jobs_failed.value(),
            jobs_canceled: self.jobs_canceled.value(),
            records_processed: self.records_processed.value(),
            batches_failed: self.batches_failed.value(),
        }
    }
}
