//! Job endpoints: start, status, errors, cancel, resume.

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use backfill_infra::{JobHost, JobSpec};

use crate::app::{dto, errors};

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /jobs
///
/// Validate and start a job. Invalid requests never create a job.
pub async fn start_job(
    Extension(host): Extension<JobHost>,
    Json(spec): Json<JobSpec>,
) -> axum::response::Response {
    match host.start_job(spec).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(dto::JobCreatedResponse {
                job_id: job_id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => errors::host_error_to_response(e),
    }
}

/// GET /jobs/:job_id
pub async fn get_status(
    Extension(host): Extension<JobHost>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match host.get_status(job_id).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => errors::host_error_to_response(e),
    }
}

/// GET /jobs/:job_id/errors
///
/// Permanent batch failures recorded so far.
pub async fn list_errors(
    Extension(host): Extension<JobHost>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match host.errors(job_id).await {
        Ok(errors) => (
            StatusCode::OK,
            Json(dto::JobErrorsResponse {
                job_id: job_id.to_string(),
                errors,
            }),
        )
            .into_response(),
        Err(e) => errors::host_error_to_response(e),
    }
}

/// POST /jobs/:job_id/cancel
pub async fn cancel(
    Extension(host): Extension<JobHost>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match host.cancel(job_id).await {
        Ok(runtime_status) => (
            StatusCode::OK,
            Json(dto::CancelResponse {
                job_id: job_id.to_string(),
                runtime_status,
            }),
        )
            .into_response(),
        Err(e) => errors::host_error_to_response(e),
    }
}

/// POST /jobs/:job_id/resume
///
/// Continue a `running` job from its last checkpoint.
pub async fn resume(
    Extension(host): Extension<JobHost>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    if let Err(e) = host.resume(job_id).await {
        return errors::host_error_to_response(e);
    }
    match host.get_status(job_id).await {
        Ok(status) => (StatusCode::ACCEPTED, Json(status)).into_response(),
        Err(e) => errors::host_error_to_response(e),
    }
}
