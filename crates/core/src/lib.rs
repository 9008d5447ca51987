//! `backfill-core` — building blocks of the watermark batch engine.
//!
//! This crate contains **pure** values and functions (no I/O, no async):
//! watermark ranges, batching options, the wave planner, and the checkpoint
//! that carries a job from one execution generation to the next.

pub mod batching;
pub mod checkpoint;
pub mod error;
pub mod id;
pub mod range;
pub mod status;
pub mod unit;

pub use batching::{BatchPlanner, BatchingOptions, Direction, PlanSource, PlannedWave};
pub use checkpoint::{BatchError, BatchOutcome, CatalogPlan, Checkpoint, RemainingWork, Wave};
pub use error::{ConfigurationError, DomainError, DomainResult};
pub use id::{GenerationHandle, JobId};
pub use range::WatermarkRange;
pub use status::{JobStatus, RuntimeStatus};
pub use unit::{BatchTarget, JobUnit, RecordIdentifier, RecordStatus};
