//! Instance registry operations

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::SqlitePool;

/// A configured remote qBittorrent endpoint.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InstanceRecord {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    /// Never serialized into API responses.
    #[serde(skip_serializing)]
    pub password: String,
    pub created_at: Option<NaiveDateTime>,
}

/// Input for registering a new instance
#[derive(Debug)]
pub struct CreateInstance {
    pub name: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    pub password: String,
}

/// Partial update; None leaves the column untouched.
#[derive(Debug, Default)]
pub struct UpdateInstance {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpdateInstance {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.host.is_none()
            && self.port.is_none()
            && self.username.is_none()
            && self.password.is_none()
    }
}

/// Instance repository for database operations
pub struct InstanceRepository {
    pool: SqlitePool,
}

impl InstanceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<InstanceRecord>> {
        Ok(sqlx::query_as("SELECT * FROM instances ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get(&self, id: i64) -> Result<Option<InstanceRecord>> {
        Ok(sqlx::query_as("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn create(&self, input: CreateInstance) -> Result<InstanceRecord> {
        let result = sqlx::query(
            "INSERT INTO instances (name, host, port, username, password) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&input.name)
        .bind(&input.host)
        .bind(input.port)
        .bind(&input.username)
        .bind(&input.password)
        .execute(&self.pool)
        .await?;

        self.get(result.last_insert_rowid())
            .await?
            .context("instance row missing after insert")
    }

    /// Applies only the provided fields; returns false when no row matched.
    pub async fn update(&self, id: i64, changes: UpdateInstance) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE instances SET \
             name = COALESCE(?, name), \
             host = COALESCE(?, host), \
             port = COALESCE(?, port), \
             username = COALESCE(?, username), \
             password = COALESCE(?, password) \
             WHERE id = ?",
        )
        .bind(changes.name)
        .bind(changes.host)
        .bind(changes.port)
        .bind(changes.username)
        .bind(changes.password)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes the instance; `torrents` and `sync_status` rows cascade.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
