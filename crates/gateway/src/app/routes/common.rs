//! Shared handler helpers.

use axum::http::StatusCode;

use crate::app::errors;
use crate::context::{AuthContext, KeyScope};

/// Scope gate used at the top of every protected handler.
pub fn require_scope(
    auth: &AuthContext,
    required: KeyScope,
) -> Result<(), axum::response::Response> {
    if auth.scope().allows(required) {
        Ok(())
    } else {
        Err(errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "API key scope does not permit this operation",
        ))
    }
}
