use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use backfill_core::JobId;
use backfill_infra::HostError;

pub fn host_error_to_response(err: HostError) -> axum::response::Response {
    match &err {
        HostError::Configuration(_) => json_error(StatusCode::BAD_REQUEST, "invalid_configuration", err.to_string()),
        HostError::UnknownJobKind(_) => json_error(StatusCode::BAD_REQUEST, "unknown_job_kind", err.to_string()),
        HostError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        HostError::AlreadyTerminal { .. } => json_error(StatusCode::CONFLICT, "already_terminal", err.to_string()),
        HostError::ShuttingDown => json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", err.to_string()),
        HostError::Catalog(_) => json_error(StatusCode::BAD_GATEWAY, "catalog_unavailable", err.to_string()),
        HostError::Store(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string()),
        HostError::Orchestration(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "orchestration_error", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.parse()
        .map_err(|e: backfill_core::DomainError| json_error(StatusCode::BAD_REQUEST, "invalid_job_id", e.to_string()))
}
