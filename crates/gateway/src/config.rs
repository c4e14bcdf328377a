//! Gateway configuration, read once at startup.

use anyhow::Context;
use serde::Deserialize;

/// Static API keys per scope. Scopes nest: admin ⊃ write ⊃ read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiKeys {
    #[serde(default)]
    pub admin: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub api_keys: ApiKeys,
    /// Fixed-window per-key limit; 0 disables rate limiting.
    pub rate_limit_per_minute: u32,
    /// Kinds that must carry an idempotency key to be accepted.
    pub idempotency_required_for_kinds: Vec<String>,
    /// How far in the future `occurred_at` may lie.
    pub max_future_skew_minutes: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_keys: ApiKeys::default(),
            rate_limit_per_minute: 0,
            idempotency_required_for_kinds: Vec::new(),
            max_future_skew_minutes: 5,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let api_keys = match std::env::var("MNX_API_KEYS") {
            Ok(raw) => serde_json::from_str(&raw)
                .context("MNX_API_KEYS must be JSON: {\"admin\": [..], \"write\": [..], \"read\": [..]}")?,
            Err(_) => {
                tracing::warn!("MNX_API_KEYS not set; using insecure dev defaults");
                ApiKeys {
                    admin: vec!["dev-admin".to_string()],
                    write: vec!["dev-write".to_string()],
                    read: vec!["dev-read".to_string()],
                }
            }
        };

        Ok(Self {
            port: match std::env::var("MNX_GATEWAY_PORT") {
                Ok(raw) => raw.parse().context("invalid MNX_GATEWAY_PORT")?,
                Err(_) => defaults.port,
            },
            api_keys,
            rate_limit_per_minute: match std::env::var("MNX_RATE_LIMIT_PER_MINUTE") {
                Ok(raw) => raw.parse().context("invalid MNX_RATE_LIMIT_PER_MINUTE")?,
                Err(_) => defaults.rate_limit_per_minute,
            },
            idempotency_required_for_kinds: match std::env::var("MNX_IDEMPOTENCY_REQUIRED_KINDS") {
                Ok(raw) => raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                Err(_) => defaults.idempotency_required_for_kinds,
            },
            max_future_skew_minutes: match std::env::var("MNX_MAX_FUTURE_SKEW_MINUTES") {
                Ok(raw) => raw.parse().context("invalid MNX_MAX_FUTURE_SKEW_MINUTES")?,
                Err(_) => defaults.max_future_skew_minutes,
            },
        })
    }
}
