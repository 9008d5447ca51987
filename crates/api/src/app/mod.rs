//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: engine wiring (checkpoint store, collaborators, job host)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: response DTOs
//! - `errors.rs`: consistent error responses

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use backfill_infra::JobHost;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(host: JobHost) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/metrics", get(routes::system::metrics))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(host)))
}
