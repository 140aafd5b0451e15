//! Torrent snapshot cache operations
//!
//! Rows mirror the last-known remote state, one per (hash, instance). The
//! sync engine overwrites and prunes them transactionally; this repository
//! serves the read side (list/filter/stat queries) and the narrow
//! action-mirroring writes the API layer applies after a confirmed remote
//! call.

use anyhow::Result;
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::qbit::models::{
    self, CHECKING_STATES, DOWNLOADING_STATES, ERROR_STATES, PAUSED_STATES, SEEDING_STATES,
    TorrentInfo,
};

/// Cached snapshot of one torrent on one instance. Serialized straight onto
/// the wire, where the owning instance travels as `containerId`.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TorrentRow {
    pub hash: String,
    #[serde(rename = "containerId")]
    pub instance_id: i64,
    pub name: String,
    pub size: i64,
    pub progress: f64,
    pub dl_rate: i64,
    pub up_rate: i64,
    pub downloaded: i64,
    pub uploaded: i64,
    pub state: String,
    pub eta: i64,
    pub category: String,
    pub tags: String,
    pub tracker: String,
    pub save_path: String,
    pub added_on: i64,
    pub completion_on: i64,
    pub last_activity: i64,
}

impl TorrentRow {
    /// Maps a live wire record onto the cache schema.
    pub fn from_live(instance_id: i64, t: &TorrentInfo) -> Self {
        Self {
            hash: t.hash.clone(),
            instance_id,
            name: t.name.clone(),
            size: t.size,
            progress: t.progress,
            dl_rate: t.dlspeed,
            up_rate: t.upspeed,
            downloaded: t.downloaded,
            uploaded: t.uploaded,
            state: t.state.clone(),
            eta: t.eta,
            category: t.category.clone(),
            tags: t.tags.clone(),
            tracker: t.tracker.clone(),
            save_path: t.save_path.clone(),
            added_on: t.added_on,
            completion_on: t.completion_on,
            last_activity: t.last_activity,
        }
    }
}

/// Filter/sort parameters for the cached list query.
#[derive(Debug, Default, Clone)]
pub struct TorrentQuery {
    /// State-family filter name ("downloading", "seeding", "completed", ...).
    pub status: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub tracker: Option<String>,
    pub save_path: Option<String>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

/// Aggregated per-instance counters, grouped by state family.
#[derive(Debug, Default, Serialize, sqlx::FromRow)]
pub struct InstanceStats {
    pub total: i64,
    pub total_dl_rate: i64,
    pub total_up_rate: i64,
    pub total_downloaded: i64,
    pub total_uploaded: i64,
    pub downloading: i64,
    pub seeding: i64,
    pub paused: i64,
    pub active: i64,
    pub error: i64,
    pub checking: i64,
    pub completed: i64,
}

/// One facet label with its torrent count.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FacetCount {
    pub label: String,
    pub count: i64,
}

/// Sort columns the list query accepts; anything else falls back to added_on.
const SORTABLE: &[&str] = &[
    "name",
    "size",
    "progress",
    "dl_rate",
    "up_rate",
    "eta",
    "added_on",
    "completion_on",
    "last_activity",
];

/// Torrent repository for database operations
pub struct TorrentRepository {
    pool: SqlitePool,
}

impl TorrentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn rows_for_instance(&self, instance_id: i64) -> Result<Vec<TorrentRow>> {
        Ok(sqlx::query_as("SELECT * FROM torrents WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn list_filtered(
        &self,
        instance_id: i64,
        q: &TorrentQuery,
    ) -> Result<Vec<TorrentRow>> {
        let mut builder = QueryBuilder::new("SELECT * FROM torrents WHERE instance_id = ");
        builder.push_bind(instance_id);

        if let Some(status) = q.status.as_deref().filter(|s| *s != "all") {
            if status == "completed" {
                // Finished means the seeding family plus finished-but-paused.
                let mut states: Vec<&str> = SEEDING_STATES.to_vec();
                states.push("pausedUP");
                push_state_filter(&mut builder, &states);
            } else if let Some(states) = models::family_states(status) {
                push_state_filter(&mut builder, states);
            }
        }
        if let Some(category) = &q.category {
            builder.push(" AND category = ").push_bind(category.clone());
        }
        if let Some(tag) = &q.tag {
            builder.push(" AND tags LIKE ").push_bind(format!("%{tag}%"));
        }
        if let Some(tracker) = &q.tracker {
            builder
                .push(" AND tracker LIKE ")
                .push_bind(format!("%{tracker}%"));
        }
        if let Some(save_path) = &q.save_path {
            builder
                .push(" AND save_path = ")
                .push_bind(save_path.clone());
        }
        if let Some(search) = &q.search {
            builder
                .push(" AND name LIKE ")
                .push_bind(format!("%{search}%"));
        }

        let sort = q
            .sort_by
            .as_deref()
            .filter(|s| SORTABLE.contains(s))
            .unwrap_or("added_on");
        let dir = if q.sort_order.as_deref() == Some("asc") {
            "ASC"
        } else {
            "DESC"
        };
        builder.push(format!(" ORDER BY {sort} {dir}"));

        Ok(builder.build_query_as().fetch_all(&self.pool).await?)
    }

    pub async fn stats(&self, instance_id: i64) -> Result<InstanceStats> {
        let sql = format!(
            "SELECT \
             COUNT(*) AS total, \
             COALESCE(SUM(dl_rate), 0) AS total_dl_rate, \
             COALESCE(SUM(up_rate), 0) AS total_up_rate, \
             COALESCE(SUM(downloaded), 0) AS total_downloaded, \
             COALESCE(SUM(uploaded), 0) AS total_uploaded, \
             COALESCE(SUM(CASE WHEN state IN ({downloading}) THEN 1 ELSE 0 END), 0) AS downloading, \
             COALESCE(SUM(CASE WHEN state IN ({seeding}) THEN 1 ELSE 0 END), 0) AS seeding, \
             COALESCE(SUM(CASE WHEN state IN ({paused}) THEN 1 ELSE 0 END), 0) AS paused, \
             COALESCE(SUM(CASE WHEN state IN ({active}) THEN 1 ELSE 0 END), 0) AS active, \
             COALESCE(SUM(CASE WHEN state IN ({error}) THEN 1 ELSE 0 END), 0) AS error, \
             COALESCE(SUM(CASE WHEN state IN ({checking}) THEN 1 ELSE 0 END), 0) AS checking, \
             COALESCE(SUM(CASE WHEN progress >= 1 THEN 1 ELSE 0 END), 0) AS completed \
             FROM torrents WHERE instance_id = ?",
            downloading = sql_in_list(DOWNLOADING_STATES),
            seeding = sql_in_list(SEEDING_STATES),
            paused = sql_in_list(PAUSED_STATES),
            active = sql_in_list(models::ACTIVE_STATES),
            error = sql_in_list(ERROR_STATES),
            checking = sql_in_list(CHECKING_STATES),
        );
        Ok(sqlx::query_as(&sql)
            .bind(instance_id)
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn category_facets(&self, instance_id: Option<i64>) -> Result<Vec<FacetCount>> {
        let mut builder = QueryBuilder::new(
            "SELECT category AS label, COUNT(*) AS count FROM torrents WHERE category != ''",
        );
        push_instance_scope(&mut builder, instance_id);
        builder.push(" GROUP BY category ORDER BY category");
        Ok(builder.build_query_as().fetch_all(&self.pool).await?)
    }

    pub async fn save_path_facets(&self, instance_id: Option<i64>) -> Result<Vec<FacetCount>> {
        let mut builder = QueryBuilder::new(
            "SELECT save_path AS label, COUNT(*) AS count FROM torrents WHERE save_path != ''",
        );
        push_instance_scope(&mut builder, instance_id);
        builder.push(" GROUP BY save_path ORDER BY save_path");
        Ok(builder.build_query_as().fetch_all(&self.pool).await?)
    }

    /// Raw tracker URLs; domain grouping happens in the API layer.
    pub async fn tracker_values(&self, instance_id: Option<i64>) -> Result<Vec<String>> {
        let mut builder = QueryBuilder::new("SELECT tracker FROM torrents WHERE tracker != ''");
        push_instance_scope(&mut builder, instance_id);
        Ok(builder.build_query_scalar().fetch_all(&self.pool).await?)
    }

    /// Raw comma-joined tag strings; splitting and counting happens in the
    /// API layer.
    pub async fn tag_values(&self, instance_id: Option<i64>) -> Result<Vec<String>> {
        let mut builder = QueryBuilder::new("SELECT tags FROM torrents WHERE tags != ''");
        push_instance_scope(&mut builder, instance_id);
        Ok(builder.build_query_scalar().fetch_all(&self.pool).await?)
    }

    /// Action-mirroring delete after a confirmed remote delete.
    pub async fn delete_many(&self, instance_id: i64, hashes: &[String]) -> Result<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::new("DELETE FROM torrents WHERE instance_id = ");
        builder.push_bind(instance_id);
        builder.push(" AND hash IN (");
        let mut separated = builder.separated(", ");
        for hash in hashes {
            separated.push_bind(hash.clone());
        }
        builder.push(")");
        Ok(builder.build().execute(&self.pool).await?.rows_affected())
    }

    /// Action-mirroring category update after a confirmed remote setCategory.
    pub async fn set_category(
        &self,
        instance_id: i64,
        hashes: &[String],
        category: &str,
    ) -> Result<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::new("UPDATE torrents SET category = ");
        builder.push_bind(category.to_string());
        builder.push(" WHERE instance_id = ").push_bind(instance_id);
        builder.push(" AND hash IN (");
        let mut separated = builder.separated(", ");
        for hash in hashes {
            separated.push_bind(hash.clone());
        }
        builder.push(")");
        Ok(builder.build().execute(&self.pool).await?.rows_affected())
    }
}

fn push_state_filter(builder: &mut QueryBuilder<'_, Sqlite>, states: &[&str]) {
    builder.push(" AND state IN (");
    let mut separated = builder.separated(", ");
    for state in states {
        separated.push_bind(state.to_string());
    }
    builder.push(")");
}

fn push_instance_scope(builder: &mut QueryBuilder<'_, Sqlite>, instance_id: Option<i64>) {
    if let Some(id) = instance_id {
        builder.push(" AND instance_id = ").push_bind(id);
    }
}

/// Inlines a state family as a quoted SQL list. Only ever called with the
/// compile-time state constants, never user input.
fn sql_in_list(states: &[&str]) -> String {
    states
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::db::{CreateInstance, Database};

    use super::*;

    async fn seeded_db(dir: &tempfile::TempDir) -> (Database, i64) {
        let path = dir.path().join("test.db");
        let db = Database::connect(path.to_str().unwrap()).await.unwrap();
        let instance = db
            .instances()
            .create(CreateInstance {
                name: "main".to_string(),
                host: "localhost".to_string(),
                port: 8080,
                username: "admin".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();
        (db, instance.id)
    }

    async fn insert_row(db: &Database, row: &TorrentRow) {
        sqlx::query(
            "INSERT INTO torrents \
             (hash, instance_id, name, size, progress, dl_rate, up_rate, downloaded, uploaded, \
              state, eta, category, tags, tracker, save_path, added_on, completion_on, last_activity) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.hash)
        .bind(row.instance_id)
        .bind(&row.name)
        .bind(row.size)
        .bind(row.progress)
        .bind(row.dl_rate)
        .bind(row.up_rate)
        .bind(row.downloaded)
        .bind(row.uploaded)
        .bind(&row.state)
        .bind(row.eta)
        .bind(&row.category)
        .bind(&row.tags)
        .bind(&row.tracker)
        .bind(&row.save_path)
        .bind(row.added_on)
        .bind(row.completion_on)
        .bind(row.last_activity)
        .execute(db.pool())
        .await
        .unwrap();
    }

    fn row(instance_id: i64, hash: &str, name: &str, state: &str, progress: f64) -> TorrentRow {
        TorrentRow {
            hash: hash.to_string(),
            instance_id,
            name: name.to_string(),
            size: 2048,
            progress,
            dl_rate: 100,
            up_rate: 50,
            downloaded: 1024,
            uploaded: 512,
            state: state.to_string(),
            eta: 600,
            category: "movies".to_string(),
            tags: "new,hd".to_string(),
            tracker: "https://tracker.example.org/announce".to_string(),
            save_path: "/downloads".to_string(),
            added_on: 1_700_000_000,
            completion_on: 0,
            last_activity: 1_700_000_100,
        }
    }

    #[tokio::test]
    async fn status_filter_selects_the_state_family() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = seeded_db(&dir).await;
        insert_row(&db, &row(id, "a", "one", "downloading", 0.2)).await;
        insert_row(&db, &row(id, "b", "two", "stalledDL", 0.3)).await;
        insert_row(&db, &row(id, "c", "three", "uploading", 1.0)).await;

        let query = TorrentQuery {
            status: Some("downloading".to_string()),
            ..Default::default()
        };
        let rows = db.torrents().list_filtered(id, &query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.state != "uploading"));
    }

    #[tokio::test]
    async fn completed_filter_includes_finished_but_paused() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = seeded_db(&dir).await;
        insert_row(&db, &row(id, "a", "one", "uploading", 1.0)).await;
        insert_row(&db, &row(id, "b", "two", "pausedUP", 1.0)).await;
        insert_row(&db, &row(id, "c", "three", "downloading", 0.5)).await;

        let query = TorrentQuery {
            status: Some("completed".to_string()),
            ..Default::default()
        };
        let rows = db.torrents().list_filtered(id, &query).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn search_and_sort_apply_together() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = seeded_db(&dir).await;
        let mut big = row(id, "a", "ubuntu-24.04.iso", "downloading", 0.2);
        big.size = 9000;
        insert_row(&db, &big).await;
        let mut small = row(id, "b", "ubuntu-22.04.iso", "downloading", 0.2);
        small.size = 1000;
        insert_row(&db, &small).await;
        insert_row(&db, &row(id, "c", "fedora.iso", "downloading", 0.2)).await;

        let query = TorrentQuery {
            search: Some("ubuntu".to_string()),
            sort_by: Some("size".to_string()),
            sort_order: Some("asc".to_string()),
            ..Default::default()
        };
        let rows = db.torrents().list_filtered(id, &query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hash, "b");
        assert_eq!(rows[1].hash, "a");
    }

    #[tokio::test]
    async fn unknown_sort_column_falls_back_to_added_on() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = seeded_db(&dir).await;
        insert_row(&db, &row(id, "a", "one", "downloading", 0.2)).await;

        let query = TorrentQuery {
            sort_by: Some("hash; DROP TABLE torrents".to_string()),
            ..Default::default()
        };
        let rows = db.torrents().list_filtered(id, &query).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn stats_counts_by_family_and_sums_rates() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = seeded_db(&dir).await;
        insert_row(&db, &row(id, "a", "one", "downloading", 0.2)).await;
        insert_row(&db, &row(id, "b", "two", "uploading", 1.0)).await;
        insert_row(&db, &row(id, "c", "three", "pausedDL", 0.7)).await;
        insert_row(&db, &row(id, "d", "four", "error", 0.1)).await;

        let stats = db.torrents().stats(id).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.downloading, 1);
        assert_eq!(stats.seeding, 1);
        assert_eq!(stats.paused, 1);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total_dl_rate, 400);
        assert_eq!(stats.total_up_rate, 200);
    }

    #[tokio::test]
    async fn stats_on_empty_instance_are_all_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = seeded_db(&dir).await;

        let stats = db.torrents().stats(id).await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.total_dl_rate, 0);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn facets_group_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = seeded_db(&dir).await;
        insert_row(&db, &row(id, "a", "one", "downloading", 0.2)).await;
        let mut other = row(id, "b", "two", "downloading", 0.2);
        other.category = "linux".to_string();
        insert_row(&db, &other).await;
        insert_row(&db, &row(id, "c", "three", "downloading", 0.2)).await;

        let facets = db.torrents().category_facets(Some(id)).await.unwrap();
        assert_eq!(facets.len(), 2);
        let movies = facets.iter().find(|f| f.label == "movies").unwrap();
        assert_eq!(movies.count, 2);
    }

    #[tokio::test]
    async fn delete_many_only_touches_named_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = seeded_db(&dir).await;
        insert_row(&db, &row(id, "a", "one", "downloading", 0.2)).await;
        insert_row(&db, &row(id, "b", "two", "downloading", 0.2)).await;

        let deleted = db
            .torrents()
            .delete_many(id, &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let rows = db.torrents().rows_for_instance(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hash, "b");
    }

    #[tokio::test]
    async fn cascade_removes_rows_with_the_instance() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = seeded_db(&dir).await;
        insert_row(&db, &row(id, "a", "one", "downloading", 0.2)).await;

        assert!(db.instances().delete(id).await.unwrap());
        assert!(db.torrents().rows_for_instance(id).await.unwrap().is_empty());
    }
}
