//! HTTP API application wiring (axum router + service wiring).
//!
//! Layout mirrors the rest of the repo:
//! - `services.rs`: store/watermark/branch/projector wiring
//! - `routes/`: HTTP routes + handlers (one file per surface)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent `{code, message}` error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

use crate::config::GatewayConfig;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(services: Arc<AppServices>, config: &GatewayConfig) -> Router {
    let auth_state = middleware::AuthState::new(config);

    // Everything under /v1 requires a key; scope checks live per handler.
    let protected = Router::new()
        .nest("/v1/events", routes::events::router())
        .nest("/v1/branches", routes::branches::router())
        .nest("/v1/admin", routes::admin::router())
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
}
