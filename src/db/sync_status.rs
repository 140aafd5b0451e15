//! Per-instance sync outcome operations

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

/// Outcome of the most recent sync attempt for one instance.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SyncStatusRecord {
    pub instance_id: i64,
    /// Epoch milliseconds of the last attempt.
    pub last_sync: Option<i64>,
    /// "success" or "error".
    pub status: Option<String>,
    pub error: Option<String>,
}

pub struct SyncStatusRepository {
    pool: SqlitePool,
}

impl SyncStatusRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, instance_id: i64) -> Result<Option<SyncStatusRecord>> {
        Ok(sqlx::query_as("SELECT * FROM sync_status WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list(&self) -> Result<Vec<SyncStatusRecord>> {
        Ok(sqlx::query_as("SELECT * FROM sync_status")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Upsert used by the engine's error path, outside the sync transaction.
    pub async fn upsert(&self, instance_id: i64, status: &str, error: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_status (instance_id, last_sync, status, error) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(instance_id)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
