//! Admin surface: spine health and projector operations.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use mnx_core::Scope;
use mnx_projector::sdk::RestoreRequest;

use crate::app::routes::common::require_scope;
use crate::app::{AppServices, dto, errors};
use crate::context::{AuthContext, KeyScope};

pub fn router() -> Router {
    Router::new()
        .route("/health", get(admin_health))
        .route("/projectors/:lens/:operation", post(projector_operation))
}

/// GET /v1/admin/health
///
/// Latest `global_seq` plus every projector watermark and the DLQ backlog.
pub async fn admin_health(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
) -> axum::response::Response {
    if let Err(response) = require_scope(&auth, KeyScope::Admin) {
        return response;
    }

    let latest_seq = match services.store.latest_seq().await {
        Ok(seq) => seq,
        Err(err) => return errors::store_error_to_response(err),
    };
    let watermarks = match services.watermarks.list().await {
        Ok(entries) => entries,
        Err(err) => {
            return errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                err.to_string(),
            );
        }
    };
    let dlq = services.store.dlq_entries(1000).await.unwrap_or_default();

    let watermarks_json: Vec<_> = watermarks
        .iter()
        .map(|wm| {
            serde_json::json!({
                "projector": wm.projector,
                "world_id": wm.scope.world_id,
                "branch": wm.scope.branch,
                "last_processed_seq": wm.last_processed_seq,
                "determinism_hash": wm.determinism_hash,
            })
        })
        .collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "latest_global_seq": latest_seq,
            "watermarks": watermarks_json,
            "dlq_depth": dlq.len(),
        })),
    )
        .into_response()
}

/// POST /v1/admin/projectors/:lens/:operation
///
/// Operations: `snapshot`, `restore`, `rebuild`. Targets the colocated
/// projector cores; split deployments address the projector's own /admin
/// routes instead.
pub async fn projector_operation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Path((lens, operation)): Path<(String, String)>,
    Json(body): Json<dto::AdminScopeBody>,
) -> axum::response::Response {
    if let Err(response) = require_scope(&auth, KeyScope::Admin) {
        return response;
    }

    let Some(core) = services.projector(&lens) else {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no projector registered for lens '{lens}'"),
        );
    };
    let scope = Scope::new(body.world_id, body.branch.clone());

    match operation.as_str() {
        "snapshot" => match core.snapshot(&scope).await {
            Ok(report) => (StatusCode::OK, Json(report)).into_response(),
            Err(e) => errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "snapshot_failed",
                e.to_string(),
            ),
        },
        "restore" => {
            let (Some(last_processed_seq), Some(state)) = (body.last_processed_seq, body.state)
            else {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    "restore requires last_processed_seq and state",
                );
            };
            let request = RestoreRequest {
                last_processed_seq,
                state,
            };
            match core.restore(&scope, &request).await {
                Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "restored"})))
                    .into_response(),
                Err(e) => errors::json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "restore_failed",
                    e.to_string(),
                ),
            }
        }
        "rebuild" => match core.rebuild(&scope, services.store.as_ref()).await {
            Ok(report) => (StatusCode::OK, Json(report)).into_response(),
            Err(e) => errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "rebuild_failed",
                e.to_string(),
            ),
        },
        other => errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("unknown operation '{other}' (expected snapshot|restore|rebuild)"),
        ),
    }
}
