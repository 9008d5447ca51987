//! Caller-facing job status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Lifecycle of one logical job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    /// Generations are still being executed (or the job awaits resumption).
    Running,
    /// All work attempted, no batch failed.
    Completed,
    /// All work attempted, some batches failed permanently.
    CompletedWithErrors,
    /// Aborted by an orchestration-fatal error.
    Failed,
    /// Cancelled by an operator.
    Canceled,
}

impl RuntimeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RuntimeStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeStatus::Running => "running",
            RuntimeStatus::Completed => "completed",
            RuntimeStatus::CompletedWithErrors => "completed_with_errors",
            RuntimeStatus::Failed => "failed",
            RuntimeStatus::Canceled => "canceled",
        }
    }
}

impl core::str::FromStr for RuntimeStatus {
    type Err = crate::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RuntimeStatus::Running),
            "completed" => Ok(RuntimeStatus::Completed),
            "completed_with_errors" => Ok(RuntimeStatus::CompletedWithErrors),
            "failed" => Ok(RuntimeStatus::Failed),
            "canceled" => Ok(RuntimeStatus::Canceled),
            other => Err(crate::error::DomainError::validation(format!(
                "unknown runtime status: {other}"
            ))),
        }
    }
}

impl core::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort status snapshot returned by `GetStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub kind: String,
    pub runtime_status: RuntimeStatus,
    pub percent_complete: f64,
    pub error_count: usize,
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default)]
    pub generation: u64,
    pub created_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
    /// Reason for a `Failed` job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}
