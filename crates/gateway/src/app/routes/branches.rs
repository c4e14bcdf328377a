//! Branch registry endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::routes::common::require_scope;
use crate::app::{AppServices, dto, errors};
use crate::context::{AuthContext, KeyScope};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_branch).get(list_branches))
        .route("/:name", get(get_branch))
}

/// POST /v1/branches
pub async fn create_branch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<dto::CreateBranchRequest>,
) -> axum::response::Response {
    if let Err(response) = require_scope(&auth, KeyScope::Write) {
        return response;
    }
    if body.branch.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "branch must be non-empty",
        );
    }

    let created_by = body.created_by.as_deref().unwrap_or("api");
    let metadata = body.metadata.unwrap_or_else(|| serde_json::json!({}));

    match services
        .branches
        .create(
            body.world_id,
            &body.branch,
            body.parent_branch.as_deref(),
            created_by,
            metadata,
        )
        .await
    {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(err) => errors::branch_error_to_response(err),
    }
}

/// GET /v1/branches?world_id
pub async fn list_branches(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<dto::WorldQuery>,
) -> axum::response::Response {
    if let Err(response) = require_scope(&auth, KeyScope::Read) {
        return response;
    }
    match services.branches.list(query.world_id).await {
        Ok(entries) => (StatusCode::OK, Json(serde_json::json!({"branches": entries}))).into_response(),
        Err(err) => errors::branch_error_to_response(err),
    }
}

/// GET /v1/branches/:name?world_id
pub async fn get_branch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
    Query(query): Query<dto::WorldQuery>,
) -> axum::response::Response {
    if let Err(response) = require_scope(&auth, KeyScope::Read) {
        return response;
    }
    match services.branches.get(query.world_id, &name).await {
        Ok(Some(entry)) => (StatusCode::OK, Json(entry)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "branch not found"),
        Err(err) => errors::branch_error_to_response(err),
    }
}
