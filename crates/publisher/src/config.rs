//! Publisher process configuration.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use mnx_store::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriberEndpoint {
    pub name: String,
    /// Full delivery URL, e.g. `http://relational:8081/events`.
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub publisher_id: String,
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub endpoints: Vec<SubscriberEndpoint>,
    /// Hard timeout per subscriber delivery.
    pub delivery_timeout: Duration,
    /// Concurrent in-flight events per batch.
    pub worker_concurrency: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publisher_id: format!("publisher-{}", uuid::Uuid::new_v4()),
            poll_interval: Duration::from_millis(500),
            batch_size: 50,
            endpoints: Vec::new(),
            delivery_timeout: Duration::from_secs(5),
            worker_concurrency: 8,
        }
    }
}

fn env_millis(key: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => {
            let ms: u64 = raw.parse().map_err(|e| anyhow::anyhow!("invalid {key}: {e}"))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

impl PublisherConfig {
    /// Read configuration from the environment. `MNX_PROJECTOR_ENDPOINTS` is
    /// a JSON array of `{name, url}` objects.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let endpoints = match std::env::var("MNX_PROJECTOR_ENDPOINTS") {
            Ok(raw) => serde_json::from_str::<Vec<SubscriberEndpoint>>(&raw)
                .context("MNX_PROJECTOR_ENDPOINTS must be a JSON array of {name, url}")?,
            Err(_) => Vec::new(),
        };
        if endpoints.is_empty() {
            anyhow::bail!("MNX_PROJECTOR_ENDPOINTS must list at least one subscriber");
        }

        Ok(Self {
            publisher_id: std::env::var("MNX_PUBLISHER_ID").unwrap_or(defaults.publisher_id),
            poll_interval: env_millis("MNX_POLL_INTERVAL_MS", defaults.poll_interval)?,
            batch_size: match std::env::var("MNX_BATCH_SIZE") {
                Ok(raw) => raw.parse().context("invalid MNX_BATCH_SIZE")?,
                Err(_) => defaults.batch_size,
            },
            endpoints,
            delivery_timeout: env_millis("MNX_PROJECTOR_TIMEOUT_MS", defaults.delivery_timeout)?,
            worker_concurrency: match std::env::var("MNX_WORKER_CONCURRENCY") {
                Ok(raw) => raw.parse().context("invalid MNX_WORKER_CONCURRENCY")?,
                Err(_) => defaults.worker_concurrency,
            },
        })
    }

    /// Retry policy handed to the store (backoff is computed store-side so
    /// all publisher instances behave identically).
    pub fn retry_policy_from_env() -> anyhow::Result<RetryPolicy> {
        let defaults = RetryPolicy::default();
        Ok(RetryPolicy {
            base_delay: match std::env::var("MNX_BASE_DELAY_S") {
                Ok(raw) => Duration::from_secs(raw.parse().context("invalid MNX_BASE_DELAY_S")?),
                Err(_) => defaults.base_delay,
            },
            max_retries: match std::env::var("MNX_MAX_RETRIES") {
                Ok(raw) => raw.parse().context("invalid MNX_MAX_RETRIES")?,
                Err(_) => defaults.max_retries,
            },
            ..defaults
        })
    }
}
