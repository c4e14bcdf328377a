//! Consistent `{code, message}` error responses.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use mnx_core::DomainError;
use mnx_store::{BranchStoreError, EventStoreError};

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "code": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Unauthorized => json_error(StatusCode::FORBIDDEN, "unauthorized", "unauthorized"),
    }
}

pub fn store_error_to_response(err: EventStoreError) -> axum::response::Response {
    match err {
        // 409 carries both sides of the conflict so clients can resolve.
        EventStoreError::DuplicateIdempotencyKey {
            idempotency_key,
            existing_event_id,
        } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "code": "conflict",
                "message": "idempotency key already used in this (world_id, branch)",
                "idempotency_key": idempotency_key,
                "event_id": existing_event_id,
            })),
        )
            .into_response(),
        EventStoreError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        EventStoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        EventStoreError::InvalidState(msg) => {
            json_error(StatusCode::CONFLICT, "invalid_state", msg)
        }
        EventStoreError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn branch_error_to_response(err: BranchStoreError) -> axum::response::Response {
    match err {
        BranchStoreError::AlreadyExists(name) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("branch '{name}' already exists"),
        ),
        BranchStoreError::UnknownParent(name) => json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("parent branch '{name}' does not exist"),
        ),
        BranchStoreError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}
