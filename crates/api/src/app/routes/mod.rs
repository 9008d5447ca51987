use axum::{
    Router,
    routing::{get, post},
};

pub mod jobs;
pub mod system;

/// Router for the job endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::start_job))
        .route("/jobs/:job_id", get(jobs::get_status))
        .route("/jobs/:job_id/errors", get(jobs::list_errors))
        .route("/jobs/:job_id/cancel", post(jobs::cancel))
        .route("/jobs/:job_id/resume", post(jobs::resume))
}
