//! Tenancy scope: the `(world_id, branch)` isolation boundary.

use serde::{Deserialize, Serialize};

use crate::id::WorldId;

/// The tenancy tuple every event, outbox row, watermark, and lens row is
/// keyed by. Two scopes never share state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub world_id: WorldId,
    pub branch: String,
}

impl Scope {
    pub fn new(world_id: WorldId, branch: impl Into<String>) -> Self {
        Self {
            world_id,
            branch: branch.into(),
        }
    }
}

impl core::fmt::Display for Scope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.world_id, self.branch)
    }
}
