use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use backfill_infra::JobHost;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Replay-safe job counters.
pub async fn metrics(Extension(host): Extension<JobHost>) -> impl IntoResponse {
    Json(host.metrics())
}
