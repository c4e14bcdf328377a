//! The immutable event envelope accepted by the gateway.
//!
//! An `EventEnvelope` is what a client submits: tenancy scope, event kind,
//! payload, and audit principal. It is the **unit of persistence**; the
//! gateway enriches it with `event_id`/`global_seq`/`received_at`/
//! `payload_hash` (see [`crate::record::EventRecord`]) but never rewrites
//! its fields. Tenancy lives on the envelope so isolation is enforced at
//! the infrastructure layer, not inside payloads.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mnx_core::{DomainError, DomainResult, Scope, WorldId};

use crate::kinds;

/// Audit principal attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct By {
    pub agent: String,
}

/// Bounds applied during envelope validation.
#[derive(Debug, Copy, Clone)]
pub struct ValidationLimits {
    /// How far in the future `occurred_at` may lie.
    pub max_future_skew: Duration,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_future_skew: Duration::minutes(5),
        }
    }
}

fn default_version() -> u32 {
    1
}

/// Client-submitted event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub world_id: WorldId,
    pub branch: String,
    pub kind: String,
    pub payload: Value,
    pub by: By,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,

    /// Envelope schema version.
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl EventEnvelope {
    pub fn new(
        world_id: WorldId,
        branch: impl Into<String>,
        kind: impl Into<String>,
        payload: Value,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            world_id,
            branch: branch.into(),
            kind: kind.into(),
            payload,
            by: By {
                agent: agent.into(),
            },
            occurred_at: None,
            version: default_version(),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.world_id, self.branch.clone())
    }

    /// Validate the envelope against the ingest rules.
    ///
    /// `now` is passed in so callers (and tests) control the clock.
    pub fn validate(&self, limits: ValidationLimits, now: DateTime<Utc>) -> DomainResult<()> {
        if self.branch.trim().is_empty() {
            return Err(DomainError::validation("branch must be non-empty"));
        }
        if self.by.agent.trim().is_empty() {
            return Err(DomainError::validation("by.agent must be non-empty"));
        }
        if !kinds::valid_kind(&self.kind) {
            return Err(DomainError::validation(format!(
                "kind '{}' does not match the dotted-namespace grammar",
                self.kind
            )));
        }
        if !self.payload.is_object() {
            return Err(DomainError::validation("payload must be a JSON object"));
        }
        if let Some(occurred_at) = self.occurred_at {
            if occurred_at > now + limits.max_future_skew {
                return Err(DomainError::validation(format!(
                    "occurred_at {} is more than {} minutes in the future",
                    occurred_at.to_rfc3339(),
                    limits.max_future_skew.num_minutes()
                )));
            }
        }
        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(DomainError::validation(
                    "idempotency_key must be non-empty when present",
                ));
            }
        }
        Ok(())
    }
}
