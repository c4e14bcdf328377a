//! Server-enriched event records and the publisher wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mnx_core::Scope;

use crate::envelope::EventEnvelope;

/// What `append` returns to the ingesting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub event_id: Uuid,
    pub global_seq: u64,
    pub received_at: DateTime<Utc>,
}

/// A committed log row: the envelope plus everything the store assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,

    /// Strictly increasing position in the global log, assigned in commit
    /// order with no gaps.
    pub global_seq: u64,

    pub received_at: DateTime<Utc>,
    pub payload_hash: String,
    pub envelope: EventEnvelope,
}

impl EventRecord {
    pub fn scope(&self) -> Scope {
        self.envelope.scope()
    }

    /// The body the publisher POSTs to each subscriber.
    pub fn to_delivery(&self) -> Delivery {
        Delivery {
            global_seq: self.global_seq,
            event_id: self.event_id,
            envelope: self.envelope.clone(),
            payload_hash: self.payload_hash.clone(),
        }
    }
}

/// Publisher-to-projector wire body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub global_seq: u64,
    pub event_id: Uuid,
    pub envelope: EventEnvelope,
    pub payload_hash: String,
}

impl Delivery {
    pub fn scope(&self) -> Scope {
        self.envelope.scope()
    }
}
