//! Engine runtime: bounded streams, retries, the generation state machine,
//! checkpoint persistence, collaborators, jobs and the job host.

pub mod activity;
pub mod checkpoint_store;
pub mod collaborators;
pub mod config;
pub mod host;
pub mod jobs;
pub mod orchestrator;
pub mod retry;
pub mod stream;

mod integration_tests;

pub use activity::{ActivityError, BatchActivity};
pub use config::EngineConfig;
pub use host::{HostError, JobHost, JobSpec, WorkSpec};
