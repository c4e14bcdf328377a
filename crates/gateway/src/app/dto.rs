//! Request/response DTOs and JSON mapping helpers.

use serde::Deserialize;
use serde_json::Value;

use mnx_core::WorldId;
use mnx_events::EventRecord;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EventsRangeQuery {
    pub world_id: WorldId,
    pub branch: String,
    #[serde(default)]
    pub from_seq: u64,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBranchRequest {
    pub world_id: WorldId,
    pub branch: String,
    #[serde(default)]
    pub parent_branch: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct WorldQuery {
    pub world_id: WorldId,
}

#[derive(Debug, Deserialize)]
pub struct AdminScopeBody {
    pub world_id: WorldId,
    pub branch: String,
    /// Restore only: operator-provided snapshot payload.
    #[serde(default)]
    pub last_processed_seq: Option<u64>,
    #[serde(default)]
    pub state: Option<Value>,
}

// -------------------------
// JSON helpers
// -------------------------

pub fn record_to_json(record: &EventRecord) -> Value {
    serde_json::json!({
        "event_id": record.event_id,
        "global_seq": record.global_seq,
        "received_at": record.received_at.to_rfc3339(),
        "payload_hash": record.payload_hash,
        "envelope": record.envelope,
    })
}
