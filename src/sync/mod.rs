//! Background sync engine
//!
//! Polls every registered instance on a fixed interval and reconciles the
//! local torrent cache against the live list. Each instance syncs in its own
//! transaction, so one unreachable remote never disturbs another instance's
//! cache. A change notification goes out only when a tick actually altered
//! rows, which keeps a quiet remote from waking clients every two seconds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use sqlx::sqlite::SqliteQueryResult;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::db::instances::InstanceRecord;
use crate::db::torrents::TorrentRow;
use crate::db::Database;
use crate::qbit::pool::ListerProvider;
use crate::ws::UpdateSink;

const UPSERT_TORRENT: &str = "INSERT OR REPLACE INTO torrents \
    (hash, instance_id, name, size, progress, dl_rate, up_rate, downloaded, uploaded, \
     state, eta, category, tags, tracker, save_path, added_on, completion_on, last_activity) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

pub struct SyncEngine {
    db: Database,
    clients: Arc<dyn ListerProvider>,
    sink: Arc<dyn UpdateSink>,
    interval: Duration,
    /// Instances with a sync currently running; a slow remote must not pile
    /// up overlapping syncs against itself.
    in_flight: Mutex<HashSet<i64>>,
}

/// Stops the polling loop when dropped or told to.
pub struct SyncEngineHandle {
    stop: watch::Sender<bool>,
}

impl SyncEngineHandle {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl SyncEngine {
    pub fn new(
        db: Database,
        clients: Arc<dyn ListerProvider>,
        sink: Arc<dyn UpdateSink>,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            clients,
            sink,
            interval,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Spawns the polling loop.
    pub fn start(self: Arc<Self>) -> SyncEngineHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let engine = self;
        info!(interval_ms = engine.interval.as_millis() as u64, "starting sync engine");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.tick().await,
                    _ = stop_rx.changed() => {
                        info!("sync engine stopped");
                        break;
                    }
                }
            }
        });
        SyncEngineHandle { stop: stop_tx }
    }

    /// One poll cycle. Instances sync concurrently; the tick does not wait
    /// for them, so a stuck remote never delays the next cycle for others.
    async fn tick(self: &Arc<Self>) {
        if self.sink.client_count() == 0 {
            return;
        }
        let instances = match self.db.instances().list().await {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "failed to load instances for sync");
                return;
            }
        };
        for instance in instances {
            if !self.in_flight.lock().insert(instance.id) {
                debug!(instance_id = instance.id, "sync already in flight, skipping");
                continue;
            }
            let engine = self.clone();
            tokio::spawn(async move {
                engine.sync_instance(&instance).await;
                engine.in_flight.lock().remove(&instance.id);
            });
        }
    }

    /// Syncs every instance sequentially and waits for completion. The
    /// polling loop does not use this; it exists for callers that need a
    /// deterministic full pass, like tests and the manual refresh endpoint.
    pub async fn sync_all(&self) -> Result<()> {
        let instances = self.db.instances().list().await?;
        for instance in &instances {
            self.sync_instance(instance).await;
        }
        Ok(())
    }

    /// Full error-handling wrapper around one instance's reconciliation.
    /// Failures are recorded in sync_status and never propagate to other
    /// instances.
    pub async fn sync_instance(&self, instance: &InstanceRecord) {
        match self.reconcile(instance).await {
            Ok(changed) => {
                if changed {
                    debug!(instance_id = instance.id, "cache changed, notifying clients");
                    self.sink.broadcast_to_instance(
                        instance.id,
                        json!({
                            "type": "torrents_updated",
                            "containerId": instance.id,
                            "timestamp": chrono::Utc::now().timestamp_millis(),
                        }),
                    );
                }
            }
            Err(e) => {
                // The instance can be deleted between the list query and the
                // writes here. The cascade already cleaned up its rows, so a
                // foreign key rejection just means this sync raced a delete.
                if is_foreign_key_violation(&e) {
                    debug!(instance_id = instance.id, "instance removed mid-sync, dropping result");
                    return;
                }
                error!(instance_id = instance.id, error = %e, "sync failed");
                // Record the whole chain, not just the outermost context, so
                // the root cause reaches the UI.
                let message = format!("{e:#}");
                if let Err(status_err) = self
                    .db
                    .sync_status()
                    .upsert(instance.id, "error", Some(&message))
                    .await
                {
                    // Recording the failure can itself fail for the same
                    // mid-sync delete reason; nothing left to record against.
                    debug!(instance_id = instance.id, error = %status_err, "failed to record sync error");
                }
            }
        }
    }

    /// Reconciles one instance's cache in a single transaction and reports
    /// whether anything actually changed. Rows identical to the live state
    /// are left untouched, so an unchanged remote produces no notification.
    async fn reconcile(&self, instance: &InstanceRecord) -> Result<bool> {
        let lister = self.clients.lister_for(instance);
        let live = lister
            .list_torrents()
            .await
            .with_context(|| format!("fetching torrents from instance {}", instance.id))?;

        let mut tx = self.db.pool().begin().await?;

        let existing: Vec<TorrentRow> =
            sqlx::query_as("SELECT * FROM torrents WHERE instance_id = ?")
                .bind(instance.id)
                .fetch_all(&mut *tx)
                .await?;
        let mut cached: HashMap<String, TorrentRow> = existing
            .into_iter()
            .map(|row| (row.hash.clone(), row))
            .collect();

        let mut changed = false;

        if live.is_empty() {
            // Remote reports nothing at all; one sweep instead of per-row
            // deletes.
            if !cached.is_empty() {
                sqlx::query("DELETE FROM torrents WHERE instance_id = ?")
                    .bind(instance.id)
                    .execute(&mut *tx)
                    .await?;
                changed = true;
            }
        } else {
            for info in &live {
                let row = TorrentRow::from_live(instance.id, info);
                if cached.remove(&row.hash).as_ref() == Some(&row) {
                    continue;
                }
                upsert_row(&mut tx, &row).await?;
                changed = true;
            }
            // Whatever remains in the map no longer exists remotely.
            for hash in cached.keys() {
                sqlx::query("DELETE FROM torrents WHERE instance_id = ? AND hash = ?")
                    .bind(instance.id)
                    .bind(hash)
                    .execute(&mut *tx)
                    .await?;
                changed = true;
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO sync_status (instance_id, last_sync, status, error) \
             VALUES (?, ?, 'success', NULL)",
        )
        .bind(instance.id)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(changed)
    }
}

async fn upsert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    row: &TorrentRow,
) -> Result<SqliteQueryResult, sqlx::Error> {
    sqlx::query(UPSERT_TORRENT)
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
        .execute(&mut **tx)
        .await
}

fn is_foreign_key_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<sqlx::Error>(),
            Some(sqlx::Error::Database(db))
                if db.kind() == sqlx::error::ErrorKind::ForeignKeyViolation
        )
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use serde_json::Value;

    use crate::db::CreateInstance;
    use crate::qbit::error::QbError;
    use crate::qbit::models::TorrentInfo;
    use crate::qbit::client::TorrentLister;

    use super::*;

    struct ScriptedLister {
        results: Mutex<VecDeque<Result<Vec<TorrentInfo>, String>>>,
    }

    impl ScriptedLister {
        fn new(results: Vec<Result<Vec<TorrentInfo>, String>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl TorrentLister for ScriptedLister {
        async fn list_torrents(&self) -> Result<Vec<TorrentInfo>, QbError> {
            match self.results.lock().pop_front() {
                Some(Ok(list)) => Ok(list),
                Some(Err(message)) => Err(QbError::Auth(message)),
                None => Ok(Vec::new()),
            }
        }
    }

    struct FakeProvider {
        listers: HashMap<i64, Arc<ScriptedLister>>,
    }

    impl ListerProvider for FakeProvider {
        fn lister_for(&self, instance: &InstanceRecord) -> Arc<dyn TorrentLister> {
            self.listers
                .get(&instance.id)
                .cloned()
                .unwrap_or_else(|| ScriptedLister::new(Vec::new()))
        }
    }

    struct FakeSink {
        clients: AtomicUsize,
        notifications: Mutex<Vec<(i64, Value)>>,
    }

    impl FakeSink {
        fn with_clients(count: usize) -> Arc<Self> {
            Arc::new(Self {
                clients: AtomicUsize::new(count),
                notifications: Mutex::new(Vec::new()),
            })
        }

        fn notified(&self) -> Vec<(i64, Value)> {
            self.notifications.lock().clone()
        }
    }

    impl UpdateSink for FakeSink {
        fn client_count(&self) -> usize {
            self.clients.load(Ordering::SeqCst)
        }

        fn broadcast_to_instance(&self, instance_id: i64, payload: Value) {
            self.notifications.lock().push((instance_id, payload));
        }
    }

    fn torrent(hash: &str, name: &str, state: &str, progress: f64) -> TorrentInfo {
        TorrentInfo {
            hash: hash.to_string(),
            name: name.to_string(),
            size: 1024,
            progress,
            dlspeed: 0,
            upspeed: 0,
            downloaded: 0,
            uploaded: 0,
            state: state.to_string(),
            eta: 0,
            category: String::new(),
            tags: String::new(),
            tracker: String::new(),
            save_path: "/downloads".to_string(),
            added_on: 1_700_000_000,
            completion_on: 0,
            last_activity: 1_700_000_000,
        }
    }

    async fn test_db(dir: &tempfile::TempDir) -> Database {
        let path = dir.path().join("test.db");
        Database::connect(path.to_str().unwrap()).await.unwrap()
    }

    async fn add_instance(db: &Database, name: &str) -> InstanceRecord {
        db.instances()
            .create(CreateInstance {
                name: name.to_string(),
                host: "localhost".to_string(),
                port: 8080,
                username: "admin".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap()
    }

    fn engine_with(
        db: Database,
        listers: HashMap<i64, Arc<ScriptedLister>>,
        sink: Arc<FakeSink>,
    ) -> Arc<SyncEngine> {
        Arc::new(SyncEngine::new(
            db,
            Arc::new(FakeProvider { listers }),
            sink,
            Duration::from_millis(2000),
        ))
    }

    #[tokio::test]
    async fn unchanged_remote_notifies_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let instance = add_instance(&db, "main").await;

        let live = vec![torrent("abc", "linux.iso", "downloading", 0.4)];
        let lister = ScriptedLister::new(vec![Ok(live.clone()), Ok(live)]);
        let sink = FakeSink::with_clients(1);
        let engine = engine_with(
            db.clone(),
            HashMap::from([(instance.id, lister)]),
            sink.clone(),
        );

        engine.sync_all().await.unwrap();
        engine.sync_all().await.unwrap();

        // First pass populates the cache, second is a no-op.
        assert_eq!(sink.notified().len(), 1);
        assert_eq!(db.torrents().rows_for_instance(instance.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_row_is_overwritten_and_notified() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let instance = add_instance(&db, "main").await;

        let lister = ScriptedLister::new(vec![
            Ok(vec![torrent("abc", "linux.iso", "downloading", 0.4)]),
            Ok(vec![torrent("abc", "linux.iso", "uploading", 1.0)]),
            Ok(vec![torrent("abc", "linux.iso", "uploading", 1.0)]),
        ]);
        let sink = FakeSink::with_clients(1);
        let engine = engine_with(
            db.clone(),
            HashMap::from([(instance.id, lister)]),
            sink.clone(),
        );

        engine.sync_all().await.unwrap();
        engine.sync_all().await.unwrap();
        engine.sync_all().await.unwrap();

        assert_eq!(sink.notified().len(), 2);
        let rows = db.torrents().rows_for_instance(instance.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "uploading");
        assert_eq!(rows[0].progress, 1.0);

        let (id, payload) = sink.notified().pop().unwrap();
        assert_eq!(id, instance.id);
        assert_eq!(payload["type"], "torrents_updated");
        assert_eq!(payload["containerId"], instance.id);
    }

    #[tokio::test]
    async fn absent_torrents_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let instance = add_instance(&db, "main").await;

        let lister = ScriptedLister::new(vec![
            Ok(vec![
                torrent("abc", "one.iso", "downloading", 0.1),
                torrent("def", "two.iso", "downloading", 0.2),
            ]),
            Ok(vec![torrent("abc", "one.iso", "downloading", 0.1)]),
        ]);
        let sink = FakeSink::with_clients(1);
        let engine = engine_with(
            db.clone(),
            HashMap::from([(instance.id, lister)]),
            sink.clone(),
        );

        engine.sync_all().await.unwrap();
        engine.sync_all().await.unwrap();

        let rows = db.torrents().rows_for_instance(instance.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hash, "abc");
        assert_eq!(sink.notified().len(), 2);
    }

    #[tokio::test]
    async fn empty_remote_clears_the_cache_in_one_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let instance = add_instance(&db, "main").await;

        let lister = ScriptedLister::new(vec![
            Ok(vec![
                torrent("abc", "one.iso", "downloading", 0.1),
                torrent("def", "two.iso", "downloading", 0.2),
            ]),
            Ok(Vec::new()),
            Ok(Vec::new()),
        ]);
        let sink = FakeSink::with_clients(1);
        let engine = engine_with(
            db.clone(),
            HashMap::from([(instance.id, lister)]),
            sink.clone(),
        );

        engine.sync_all().await.unwrap();
        engine.sync_all().await.unwrap();
        engine.sync_all().await.unwrap();

        assert!(db.torrents().rows_for_instance(instance.id).await.unwrap().is_empty());
        // Populate, clear, then nothing left to clear.
        assert_eq!(sink.notified().len(), 2);
    }

    #[tokio::test]
    async fn one_failing_instance_does_not_disturb_another() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let broken = add_instance(&db, "broken").await;
        let healthy = add_instance(&db, "healthy").await;

        let listers = HashMap::from([
            (
                broken.id,
                ScriptedLister::new(vec![Err("credentials rejected".to_string())]),
            ),
            (
                healthy.id,
                ScriptedLister::new(vec![Ok(vec![torrent("abc", "one.iso", "uploading", 1.0)])]),
            ),
        ]);
        let sink = FakeSink::with_clients(1);
        let engine = engine_with(db.clone(), listers, sink.clone());

        engine.sync_all().await.unwrap();

        assert_eq!(db.torrents().rows_for_instance(healthy.id).await.unwrap().len(), 1);
        assert!(db.torrents().rows_for_instance(broken.id).await.unwrap().is_empty());

        let broken_status = db.sync_status().get(broken.id).await.unwrap().unwrap();
        assert_eq!(broken_status.status.as_deref(), Some("error"));
        assert!(broken_status.error.unwrap().contains("credentials rejected"));

        let healthy_status = db.sync_status().get(healthy.id).await.unwrap().unwrap();
        assert_eq!(healthy_status.status.as_deref(), Some("success"));
        assert!(healthy_status.error.is_none());

        assert_eq!(sink.notified().len(), 1);
        assert_eq!(sink.notified()[0].0, healthy.id);
    }

    #[tokio::test]
    async fn instance_deleted_mid_sync_is_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let instance = add_instance(&db, "doomed").await;

        let lister = ScriptedLister::new(vec![Ok(vec![torrent(
            "abc",
            "one.iso",
            "downloading",
            0.5,
        )])]);
        let sink = FakeSink::with_clients(1);
        let engine = engine_with(
            db.clone(),
            HashMap::from([(instance.id, lister)]),
            sink.clone(),
        );

        // Simulate a delete racing the in-flight sync: the record is already
        // loaded but the row is gone before the writes land.
        assert!(db.instances().delete(instance.id).await.unwrap());
        engine.sync_instance(&instance).await;

        assert!(db.torrents().rows_for_instance(instance.id).await.unwrap().is_empty());
        assert!(db.sync_status().get(instance.id).await.unwrap().is_none());
        assert!(sink.notified().is_empty());
    }

    #[tokio::test]
    async fn tick_is_skipped_with_no_connected_clients() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let instance = add_instance(&db, "main").await;

        let lister = ScriptedLister::new(vec![Ok(vec![torrent(
            "abc",
            "one.iso",
            "downloading",
            0.5,
        )])]);
        let sink = FakeSink::with_clients(0);
        let engine = engine_with(
            db.clone(),
            HashMap::from([(instance.id, lister)]),
            sink.clone(),
        );

        engine.tick().await;

        assert!(db.torrents().rows_for_instance(instance.id).await.unwrap().is_empty());
        assert!(sink.notified().is_empty());
    }
}
