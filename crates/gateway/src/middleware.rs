//! API-key auth and rate limiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::config::{ApiKeys, GatewayConfig};
use crate::context::{AuthContext, CorrelationContext, KeyScope};

/// Fixed-window per-key request counter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, (u64, u32)>>,
}

impl RateLimiter {
    /// Returns false when the key has exhausted its budget for the current
    /// minute window.
    pub fn check(&self, key: &str, limit_per_minute: u32) -> bool {
        if limit_per_minute == 0 {
            return true;
        }
        let minute = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() / 60)
            .unwrap_or(0);

        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(_) => return true,
        };
        let entry = windows.entry(key.to_string()).or_insert((minute, 0));
        if entry.0 != minute {
            *entry = (minute, 0);
        }
        entry.1 += 1;
        entry.1 <= limit_per_minute
    }
}

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<ApiKeys>,
    limiter: Arc<RateLimiter>,
    rate_limit_per_minute: u32,
}

impl AuthState {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            keys: Arc::new(config.api_keys.clone()),
            limiter: Arc::new(RateLimiter::default()),
            rate_limit_per_minute: config.rate_limit_per_minute,
        }
    }

    fn resolve(&self, key: &str) -> Option<KeyScope> {
        if self.keys.admin.iter().any(|k| k == key) {
            Some(KeyScope::Admin)
        } else if self.keys.write.iter().any(|k| k == key) {
            Some(KeyScope::Write)
        } else if self.keys.read.iter().any(|k| k == key) {
            Some(KeyScope::Read)
        } else {
            None
        }
    }
}

pub async fn auth_middleware(
    axum::extract::State(state): axum::extract::State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_key(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    let scope = state.resolve(key).ok_or(StatusCode::UNAUTHORIZED)?;

    if !state.limiter.check(key, state.rate_limit_per_minute) {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    let correlation = req
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.extensions_mut().insert(AuthContext::new(scope));
    req.extensions_mut().insert(CorrelationContext(correlation));

    Ok(next.run(req).await)
}

fn extract_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(header) = headers.get(axum::http::header::AUTHORIZATION) {
        let header = header.to_str().ok()?;
        let token = header.strip_prefix("Bearer ")?.trim();
        if !token.is_empty() {
            return Some(token);
        }
        return None;
    }

    let key = headers.get("x-api-key")?.to_str().ok()?.trim();
    if key.is_empty() { None } else { Some(key) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_enforces_window_budget() {
        let limiter = RateLimiter::default();
        assert!(limiter.check("k", 2));
        assert!(limiter.check("k", 2));
        assert!(!limiter.check("k", 2));
        // Other keys have their own budget; 0 disables limiting.
        assert!(limiter.check("other", 2));
        assert!(limiter.check("k", 0));
    }
}
