//! Database connection and repositories
//!
//! SQLite holds the instance registry and the mirrored torrent cache. The
//! sync engine is the sole writer of `torrents` and `sync_status`; cascade
//! deletes keep both consistent when an instance is removed.

pub mod instances;
pub mod sync_status;
pub mod torrents;

use anyhow::Result;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub use instances::{CreateInstance, InstanceRecord, InstanceRepository, UpdateInstance};
pub use sync_status::{SyncStatusRecord, SyncStatusRepository};
pub use torrents::{FacetCount, InstanceStats, TorrentQuery, TorrentRepository, TorrentRow};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS torrents (
    hash TEXT NOT NULL,
    instance_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    size INTEGER NOT NULL,
    progress REAL NOT NULL,
    dl_rate INTEGER NOT NULL DEFAULT 0,
    up_rate INTEGER NOT NULL DEFAULT 0,
    downloaded INTEGER NOT NULL DEFAULT 0,
    uploaded INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    eta INTEGER NOT NULL DEFAULT 0,
    category TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '',
    tracker TEXT NOT NULL DEFAULT '',
    save_path TEXT NOT NULL DEFAULT '',
    added_on INTEGER NOT NULL DEFAULT 0,
    completion_on INTEGER NOT NULL DEFAULT 0,
    last_activity INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (hash, instance_id),
    FOREIGN KEY (instance_id) REFERENCES instances(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS sync_status (
    instance_id INTEGER PRIMARY KEY,
    last_sync INTEGER,
    status TEXT,
    error TEXT,
    FOREIGN KEY (instance_id) REFERENCES instances(id) ON DELETE CASCADE
);
"#;

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the maximum connection pool size from environment or default
    fn max_connections() -> u32 {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10)
    }

    /// Opens (creating if missing) the SQLite database at `path` and
    /// bootstraps the schema. Foreign keys are enforced per connection so
    /// cascades and the instance-deleted-during-sync race behave.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(Self::max_connections())
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.bootstrap().await?;
        Ok(db)
    }

    pub async fn bootstrap(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn instances(&self) -> InstanceRepository {
        InstanceRepository::new(self.pool.clone())
    }

    pub fn torrents(&self) -> TorrentRepository {
        TorrentRepository::new(self.pool.clone())
    }

    pub fn sync_status(&self) -> SyncStatusRepository {
        SyncStatusRepository::new(self.pool.clone())
    }
}
