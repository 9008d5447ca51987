use serde::Serialize;

use backfill_core::{BatchError, RuntimeStatus};

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobCreatedResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct JobErrorsResponse {
    pub job_id: String,
    pub errors: Vec<BatchError>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub runtime_status: RuntimeStatus,
}
