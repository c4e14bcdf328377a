//! HTTP receiver runtime for a projector.
//!
//! `POST /events` is the delivery surface the CDC publisher fans out to;
//! `GET /health` and `GET /metrics` are the operational surfaces; the
//! `/admin/*` routes expose the SDK's snapshot/restore/rebuild hooks for the
//! gateway's admin surface.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use mnx_core::{Scope, WorldId};
use mnx_events::Delivery;
use mnx_observability::MetricsRegistry;
use mnx_store::EventStore;

use crate::sdk::{ApplyOutcome, ProjectorCore, ProjectorError, RestoreRequest};

/// Shared state behind the receiver routes.
pub struct ProjectorRuntime {
    pub core: Arc<ProjectorCore>,
    pub metrics: Arc<MetricsRegistry>,
    /// Log access for rebuilds; colocated deployments wire the event store
    /// in, pure HTTP projectors leave it out and reject rebuild requests.
    pub replay_source: Option<Arc<dyn EventStore>>,
}

impl ProjectorRuntime {
    pub fn new(core: Arc<ProjectorCore>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            core,
            metrics,
            replay_source: None,
        }
    }

    pub fn with_replay_source(mut self, source: Arc<dyn EventStore>) -> Self {
        self.replay_source = Some(source);
        self
    }
}

pub fn router(runtime: Arc<ProjectorRuntime>) -> Router {
    Router::new()
        .route("/events", post(receive_event))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/admin/snapshot", post(admin_snapshot))
        .route("/admin/restore", post(admin_restore))
        .route("/admin/rebuild", post(admin_rebuild))
        .layer(Extension(runtime))
}

fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(json!({"code": code, "message": message.into()})),
    )
        .into_response()
}

async fn receive_event(
    Extension(runtime): Extension<Arc<ProjectorRuntime>>,
    Json(delivery): Json<Delivery>,
) -> axum::response::Response {
    match runtime.core.handle_delivery(&delivery).await {
        Ok(outcome) => {
            let counter = match outcome {
                ApplyOutcome::Applied => "events_applied_total",
                ApplyOutcome::Duplicate => "events_duplicate_total",
            };
            runtime.metrics.counter(counter).inc();
            (
                StatusCode::OK,
                Json(json!({"status": outcome, "global_seq": delivery.global_seq})),
            )
                .into_response()
        }
        Err(ProjectorError::Integrity { event_id, expected, computed }) => {
            runtime.metrics.counter("integrity_failures_total").inc();
            json_error(
                StatusCode::BAD_REQUEST,
                "payload_hash_mismatch",
                format!("event {event_id}: expected {expected}, computed {computed}"),
            )
        }
        Err(e) => {
            runtime.metrics.counter("events_errored_total").inc();
            warn!(error = %e, global_seq = delivery.global_seq, "delivery processing failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "projector_error", e.to_string())
        }
    }
}

async fn health(
    Extension(runtime): Extension<Arc<ProjectorRuntime>>,
) -> axum::response::Response {
    let watermarks = runtime
        .core
        .watermarks()
        .count(runtime.core.name())
        .await
        .unwrap_or(0);
    (
        StatusCode::OK,
        Json(json!({
            "projector": runtime.core.name(),
            "lens": runtime.core.lens().name(),
            "watermarks": watermarks,
        })),
    )
        .into_response()
}

async fn metrics(
    Extension(runtime): Extension<Arc<ProjectorRuntime>>,
) -> axum::response::Response {
    (StatusCode::OK, runtime.metrics.render()).into_response()
}

#[derive(Debug, Deserialize)]
struct ScopeRequest {
    world_id: WorldId,
    branch: String,
}

impl ScopeRequest {
    fn scope(&self) -> Scope {
        Scope::new(self.world_id, self.branch.clone())
    }
}

async fn admin_snapshot(
    Extension(runtime): Extension<Arc<ProjectorRuntime>>,
    Json(request): Json<ScopeRequest>,
) -> axum::response::Response {
    match runtime.core.snapshot(&request.scope()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "snapshot_failed", e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct RestoreBody {
    world_id: WorldId,
    branch: String,
    #[serde(flatten)]
    request: RestoreRequest,
}

async fn admin_restore(
    Extension(runtime): Extension<Arc<ProjectorRuntime>>,
    Json(body): Json<RestoreBody>,
) -> axum::response::Response {
    let scope = Scope::new(body.world_id, body.branch.clone());
    match runtime.core.restore(&scope, &body.request).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "restored"}))).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "restore_failed", e.to_string()),
    }
}

async fn admin_rebuild(
    Extension(runtime): Extension<Arc<ProjectorRuntime>>,
    Json(request): Json<ScopeRequest>,
) -> axum::response::Response {
    let Some(source) = runtime.replay_source.clone() else {
        return json_error(
            StatusCode::CONFLICT,
            "no_replay_source",
            "this projector has no event store access for rebuilds",
        );
    };
    match runtime.core.rebuild(&request.scope(), source.as_ref()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "rebuild_failed", e.to_string()),
    }
}
