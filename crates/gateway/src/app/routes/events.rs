//! Event ingest and read endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use tracing::info;

use mnx_events::EventEnvelope;

use crate::app::routes::common::require_scope;
use crate::app::{AppServices, dto, errors};
use crate::context::{AuthContext, CorrelationContext, KeyScope};

pub fn router() -> Router {
    Router::new()
        .route("/", post(ingest).get(range_read))
        .route("/:event_id", get(get_event))
}

/// POST /v1/events
///
/// Validate and persist one envelope. 4xx responses never produce log rows;
/// a retried request with the same idempotency key resolves to the same
/// `event_id` via the 409 body.
pub async fn ingest(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<CorrelationContext>,
    headers: HeaderMap,
    body: Result<Json<EventEnvelope>, JsonRejection>,
) -> axum::response::Response {
    if let Err(response) = require_scope(&auth, KeyScope::Write) {
        return response;
    }

    let Json(mut envelope) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("malformed envelope: {rejection}"),
            );
        }
    };

    // Idempotency key may arrive in the header, the envelope, or both; both
    // must agree when both appear. The header is the canonical source for
    // HTTP retries.
    let header_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    match (header_key, envelope.idempotency_key.as_deref()) {
        (Some(header), Some(body_key)) if header != body_key => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "Idempotency-Key header and envelope idempotency_key disagree",
            );
        }
        (Some(header), _) => envelope.idempotency_key = Some(header.to_string()),
        (None, _) => {}
    }

    if let Err(err) = envelope.validate(services.limits, Utc::now()) {
        return errors::domain_error_to_response(err);
    }
    if services.idempotency_required.contains(&envelope.kind) && envelope.idempotency_key.is_none()
    {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("kind '{}' requires an idempotency key", envelope.kind),
        );
    }

    match services.store.append(envelope).await {
        Ok(receipt) => {
            info!(
                correlation_id = %correlation.0,
                global_seq = receipt.global_seq,
                event_id = %receipt.event_id,
                "event appended"
            );
            (StatusCode::CREATED, Json(receipt)).into_response()
        }
        Err(err) => errors::store_error_to_response(err),
    }
}

/// GET /v1/events/:event_id
pub async fn get_event(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Path(event_id): Path<String>,
) -> axum::response::Response {
    if let Err(response) = require_scope(&auth, KeyScope::Read) {
        return response;
    }

    let event_id = match event_id.parse::<uuid::Uuid>() {
        Ok(id) => id,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid event id");
        }
    };

    match services.store.get_event(event_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(dto::record_to_json(&record))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "event not found"),
        Err(err) => errors::store_error_to_response(err),
    }
}

/// GET /v1/events?world_id&branch&from_seq&limit
pub async fn range_read(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<dto::EventsRangeQuery>,
) -> axum::response::Response {
    if let Err(response) = require_scope(&auth, KeyScope::Read) {
        return response;
    }

    let scope = mnx_core::Scope::new(query.world_id, query.branch.clone());
    let limit = query.limit.unwrap_or(100).min(1000);

    match services.store.read_range(&scope, query.from_seq, limit).await {
        Ok(records) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "events": records.iter().map(dto::record_to_json).collect::<Vec<_>>(),
                "count": records.len(),
            })),
        )
            .into_response(),
        Err(err) => errors::store_error_to_response(err),
    }
}
