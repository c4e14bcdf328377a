//! Branch registry: named divergences within a world.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use mnx_core::WorldId;

/// The implicit root branch every world starts with.
pub const MAIN_BRANCH: &str = "main";

#[derive(Debug, Error)]
pub enum BranchStoreError {
    #[error("branch '{0}' already exists")]
    AlreadyExists(String),

    #[error("parent branch '{0}' does not exist")]
    UnknownParent(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchEntry {
    pub world_id: WorldId,
    pub branch_name: String,
    pub parent_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait BranchStore: Send + Sync {
    /// Register a branch. The parent must exist (or be `main`, which is
    /// implicitly valid for every world).
    async fn create(
        &self,
        world_id: WorldId,
        branch_name: &str,
        parent_branch: Option<&str>,
        created_by: &str,
        metadata: serde_json::Value,
    ) -> Result<BranchEntry, BranchStoreError>;

    async fn get(
        &self,
        world_id: WorldId,
        branch_name: &str,
    ) -> Result<Option<BranchEntry>, BranchStoreError>;

    async fn list(&self, world_id: WorldId) -> Result<Vec<BranchEntry>, BranchStoreError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryBranchStore {
    inner: Arc<Mutex<BTreeMap<(WorldId, String), BranchEntry>>>,
}

impl InMemoryBranchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BranchStore for InMemoryBranchStore {
    async fn create(
        &self,
        world_id: WorldId,
        branch_name: &str,
        parent_branch: Option<&str>,
        created_by: &str,
        metadata: serde_json::Value,
    ) -> Result<BranchEntry, BranchStoreError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| BranchStoreError::Storage("lock poisoned".to_string()))?;

        let key = (world_id, branch_name.to_string());
        if map.contains_key(&key) {
            return Err(BranchStoreError::AlreadyExists(branch_name.to_string()));
        }
        if let Some(parent) = parent_branch {
            if parent != MAIN_BRANCH && !map.contains_key(&(world_id, parent.to_string())) {
                return Err(BranchStoreError::UnknownParent(parent.to_string()));
            }
        }

        let entry = BranchEntry {
            world_id,
            branch_name: branch_name.to_string(),
            parent_branch: parent_branch.map(str::to_string),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            metadata,
        };
        map.insert(key, entry.clone());
        Ok(entry)
    }

    async fn get(
        &self,
        world_id: WorldId,
        branch_name: &str,
    ) -> Result<Option<BranchEntry>, BranchStoreError> {
        let map = self
            .inner
            .lock()
            .map_err(|_| BranchStoreError::Storage("lock poisoned".to_string()))?;
        Ok(map.get(&(world_id, branch_name.to_string())).cloned())
    }

    async fn list(&self, world_id: WorldId) -> Result<Vec<BranchEntry>, BranchStoreError> {
        let map = self
            .inner
            .lock()
            .map_err(|_| BranchStoreError::Storage("lock poisoned".to_string()))?;
        Ok(map
            .values()
            .filter(|e| e.world_id == world_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresBranchStore {
    pool: PgPool,
}

impl PostgresBranchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_err(operation: &str, err: sqlx::Error) -> BranchStoreError {
    BranchStoreError::Storage(format!("sqlx error in {operation}: {err}"))
}

fn entry_from_row(world_id: WorldId, row: &sqlx::postgres::PgRow) -> Result<BranchEntry, sqlx::Error> {
    Ok(BranchEntry {
        world_id,
        branch_name: row.try_get("branch_name")?,
        parent_branch: row.try_get("parent_branch")?,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait]
impl BranchStore for PostgresBranchStore {
    async fn create(
        &self,
        world_id: WorldId,
        branch_name: &str,
        parent_branch: Option<&str>,
        created_by: &str,
        metadata: serde_json::Value,
    ) -> Result<BranchEntry, BranchStoreError> {
        if let Some(parent) = parent_branch {
            if parent != MAIN_BRANCH && self.get(world_id, parent).await?.is_none() {
                return Err(BranchStoreError::UnknownParent(parent.to_string()));
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO branches (world_id, branch_name, parent_branch, created_by, metadata) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (world_id, branch_name) DO NOTHING \
             RETURNING branch_name, parent_branch, created_at, created_by, metadata",
        )
        .bind(world_id.as_uuid())
        .bind(branch_name)
        .bind(parent_branch)
        .bind(created_by)
        .bind(&metadata)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("create_branch", e))?;

        match inserted {
            Some(row) => {
                entry_from_row(world_id, &row).map_err(|e| storage_err("decode_branch", e))
            }
            None => Err(BranchStoreError::AlreadyExists(branch_name.to_string())),
        }
    }

    async fn get(
        &self,
        world_id: WorldId,
        branch_name: &str,
    ) -> Result<Option<BranchEntry>, BranchStoreError> {
        let row = sqlx::query(
            "SELECT branch_name, parent_branch, created_at, created_by, metadata \
             FROM branches WHERE world_id = $1 AND branch_name = $2",
        )
        .bind(world_id.as_uuid())
        .bind(branch_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("get_branch", e))?;

        row.map(|r| entry_from_row(world_id, &r))
            .transpose()
            .map_err(|e| storage_err("decode_branch", e))
    }

    async fn list(&self, world_id: WorldId) -> Result<Vec<BranchEntry>, BranchStoreError> {
        let rows = sqlx::query(
            "SELECT branch_name, parent_branch, created_at, created_by, metadata \
             FROM branches WHERE world_id = $1 ORDER BY branch_name",
        )
        .bind(world_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_err("list_branches", e))?;

        rows.iter()
            .map(|r| entry_from_row(world_id, r))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| storage_err("decode_branch", e))
    }
}
