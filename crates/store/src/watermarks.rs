//! Projector watermark persistence.
//!
//! A watermark tracks the last processed `global_seq` and the determinism
//! hash per `(projector_name, world_id, branch)`. Advancement uses CAS
//! semantics: an update only lands when the new sequence is strictly
//! greater, which makes re-delivery a no-op and keeps the watermark
//! monotone across crashes and concurrent workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use mnx_core::{Scope, WorldId};

#[derive(Debug, Error)]
pub enum WatermarkStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Watermark {
    pub projector: String,
    pub scope: Scope,
    pub last_processed_seq: u64,
    pub determinism_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(
        &self,
        projector: &str,
        scope: &Scope,
    ) -> Result<Option<Watermark>, WatermarkStoreError>;

    /// Advance the watermark iff `seq` is strictly greater than the stored
    /// sequence. Returns whether the update landed.
    async fn advance(
        &self,
        projector: &str,
        scope: &Scope,
        seq: u64,
        determinism_hash: &str,
    ) -> Result<bool, WatermarkStoreError>;

    /// Reset to zero (rebuilds only).
    async fn reset(&self, projector: &str, scope: &Scope) -> Result<(), WatermarkStoreError>;

    async fn list(&self) -> Result<Vec<Watermark>, WatermarkStoreError>;

    async fn count(&self, projector: &str) -> Result<u64, WatermarkStoreError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryWatermarkStore {
    inner: Arc<Mutex<HashMap<(String, Scope), Watermark>>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, Scope), Watermark>>, WatermarkStoreError>
    {
        self.inner
            .lock()
            .map_err(|_| WatermarkStoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn get(
        &self,
        projector: &str,
        scope: &Scope,
    ) -> Result<Option<Watermark>, WatermarkStoreError> {
        Ok(self
            .lock()?
            .get(&(projector.to_string(), scope.clone()))
            .cloned())
    }

    async fn advance(
        &self,
        projector: &str,
        scope: &Scope,
        seq: u64,
        determinism_hash: &str,
    ) -> Result<bool, WatermarkStoreError> {
        let mut map = self.lock()?;
        let key = (projector.to_string(), scope.clone());
        match map.get_mut(&key) {
            Some(existing) if existing.last_processed_seq >= seq => Ok(false),
            Some(existing) => {
                existing.last_processed_seq = seq;
                existing.determinism_hash = Some(determinism_hash.to_string());
                existing.updated_at = Utc::now();
                Ok(true)
            }
            None => {
                map.insert(
                    key,
                    Watermark {
                        projector: projector.to_string(),
                        scope: scope.clone(),
                        last_processed_seq: seq,
                        determinism_hash: Some(determinism_hash.to_string()),
                        updated_at: Utc::now(),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn reset(&self, projector: &str, scope: &Scope) -> Result<(), WatermarkStoreError> {
        let mut map = self.lock()?;
        map.insert(
            (projector.to_string(), scope.clone()),
            Watermark {
                projector: projector.to_string(),
                scope: scope.clone(),
                last_processed_seq: 0,
                determinism_hash: None,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>, WatermarkStoreError> {
        let mut all: Vec<Watermark> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| {
            (&a.projector, &a.scope).cmp(&(&b.projector, &b.scope))
        });
        Ok(all)
    }

    async fn count(&self, projector: &str) -> Result<u64, WatermarkStoreError> {
        Ok(self
            .lock()?
            .keys()
            .filter(|(name, _)| name == projector)
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresWatermarkStore {
    pool: PgPool,
}

impl PostgresWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_err(operation: &str, err: sqlx::Error) -> WatermarkStoreError {
    WatermarkStoreError::Storage(format!("sqlx error in {operation}: {err}"))
}

#[async_trait]
impl WatermarkStore for PostgresWatermarkStore {
    async fn get(
        &self,
        projector: &str,
        scope: &Scope,
    ) -> Result<Option<Watermark>, WatermarkStoreError> {
        let row = sqlx::query(
            "SELECT last_processed_seq, determinism_hash, updated_at \
             FROM projector_watermarks \
             WHERE projector_name = $1 AND world_id = $2 AND branch = $3",
        )
        .bind(projector)
        .bind(scope.world_id.as_uuid())
        .bind(&scope.branch)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("get_watermark", e))?;

        row.map(|r| {
            let seq: i64 = r
                .try_get("last_processed_seq")
                .map_err(|e| storage_err("decode_watermark", e))?;
            Ok(Watermark {
                projector: projector.to_string(),
                scope: scope.clone(),
                last_processed_seq: seq as u64,
                determinism_hash: r
                    .try_get("determinism_hash")
                    .map_err(|e| storage_err("decode_watermark", e))?,
                updated_at: r
                    .try_get("updated_at")
                    .map_err(|e| storage_err("decode_watermark", e))?,
            })
        })
        .transpose()
    }

    async fn advance(
        &self,
        projector: &str,
        scope: &Scope,
        seq: u64,
        determinism_hash: &str,
    ) -> Result<bool, WatermarkStoreError> {
        // CAS in one statement: insert, or update only when strictly ahead.
        let result = sqlx::query(
            "INSERT INTO projector_watermarks \
                 (projector_name, world_id, branch, last_processed_seq, determinism_hash, updated_at) \
             VALUES ($1, $2, $3, $4, $5, now()) \
             ON CONFLICT (projector_name, world_id, branch) DO UPDATE SET \
                 last_processed_seq = EXCLUDED.last_processed_seq, \
                 determinism_hash = EXCLUDED.determinism_hash, \
                 updated_at = now() \
             WHERE projector_watermarks.last_processed_seq < EXCLUDED.last_processed_seq",
        )
        .bind(projector)
        .bind(scope.world_id.as_uuid())
        .bind(&scope.branch)
        .bind(seq as i64)
        .bind(determinism_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("advance_watermark", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset(&self, projector: &str, scope: &Scope) -> Result<(), WatermarkStoreError> {
        sqlx::query(
            "INSERT INTO projector_watermarks \
                 (projector_name, world_id, branch, last_processed_seq, determinism_hash, updated_at) \
             VALUES ($1, $2, $3, 0, NULL, now()) \
             ON CONFLICT (projector_name, world_id, branch) DO UPDATE SET \
                 last_processed_seq = 0, determinism_hash = NULL, updated_at = now()",
        )
        .bind(projector)
        .bind(scope.world_id.as_uuid())
        .bind(&scope.branch)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("reset_watermark", e))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>, WatermarkStoreError> {
        let rows = sqlx::query(
            "SELECT projector_name, world_id, branch, last_processed_seq, determinism_hash, updated_at \
             FROM projector_watermarks ORDER BY projector_name, world_id, branch",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_err("list_watermarks", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let world_id: Uuid = r
                .try_get("world_id")
                .map_err(|e| storage_err("decode_watermark", e))?;
            let branch: String = r
                .try_get("branch")
                .map_err(|e| storage_err("decode_watermark", e))?;
            let seq: i64 = r
                .try_get("last_processed_seq")
                .map_err(|e| storage_err("decode_watermark", e))?;
            out.push(Watermark {
                projector: r
                    .try_get("projector_name")
                    .map_err(|e| storage_err("decode_watermark", e))?,
                scope: Scope::new(WorldId::from_uuid(world_id), branch),
                last_processed_seq: seq as u64,
                determinism_hash: r
                    .try_get("determinism_hash")
                    .map_err(|e| storage_err("decode_watermark", e))?,
                updated_at: r
                    .try_get("updated_at")
                    .map_err(|e| storage_err("decode_watermark", e))?,
            });
        }
        Ok(out)
    }

    async fn count(&self, projector: &str) -> Result<u64, WatermarkStoreError> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM projector_watermarks WHERE projector_name = $1")
                .bind(projector)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| storage_err("count_watermarks", e))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| storage_err("decode_count", e))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new(WorldId::new(), "main")
    }

    #[tokio::test]
    async fn advance_is_strictly_monotone() {
        let store = InMemoryWatermarkStore::new();
        let scope = scope();

        assert!(store.advance("relational", &scope, 3, "h3").await.unwrap());
        // Re-delivery of the same sequence is a no-op.
        assert!(!store.advance("relational", &scope, 3, "h3").await.unwrap());
        // Regression is a no-op.
        assert!(!store.advance("relational", &scope, 2, "h2").await.unwrap());
        assert!(store.advance("relational", &scope, 4, "h4").await.unwrap());

        let wm = store.get("relational", &scope).await.unwrap().unwrap();
        assert_eq!(wm.last_processed_seq, 4);
        assert_eq!(wm.determinism_hash.as_deref(), Some("h4"));
    }

    #[tokio::test]
    async fn reset_returns_watermark_to_zero() {
        let store = InMemoryWatermarkStore::new();
        let scope = scope();
        store.advance("graph", &scope, 10, "h").await.unwrap();
        store.reset("graph", &scope).await.unwrap();

        let wm = store.get("graph", &scope).await.unwrap().unwrap();
        assert_eq!(wm.last_processed_seq, 0);
        assert!(wm.determinism_hash.is_none());
        // After a reset, sequence 1 advances again.
        assert!(store.advance("graph", &scope, 1, "h1").await.unwrap());
    }

    #[tokio::test]
    async fn watermarks_are_isolated_per_projector_and_scope() {
        let store = InMemoryWatermarkStore::new();
        let a = scope();
        let b = Scope::new(a.world_id, "alt");

        store.advance("relational", &a, 5, "ha").await.unwrap();
        store.advance("semantic", &a, 2, "hs").await.unwrap();
        store.advance("relational", &b, 9, "hb").await.unwrap();

        assert_eq!(store.count("relational").await.unwrap(), 2);
        assert_eq!(store.count("semantic").await.unwrap(), 1);
        assert_eq!(
            store
                .get("relational", &a)
                .await
                .unwrap()
                .unwrap()
                .last_processed_seq,
            5
        );
    }
}
