//! Per-instance client registry
//!
//! Sessions are expensive to establish, so clients are kept alive across
//! sync ticks and API calls instead of logging in per request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::instances::InstanceRecord;

use super::client::{QbClient, TorrentLister};

/// Resolves the session client for an instance. The sync engine only sees
/// this seam, so tests can substitute scripted listers.
pub trait ListerProvider: Send + Sync {
    fn lister_for(&self, instance: &InstanceRecord) -> Arc<dyn TorrentLister>;
}

struct PoolEntry {
    endpoint: (String, i64, String, String),
    client: Arc<QbClient>,
}

/// One authenticated [`QbClient`] per instance id. An endpoint or credential
/// edit replaces the client (and its now-stale session) on next use.
#[derive(Default)]
pub struct QbClientPool {
    clients: Mutex<HashMap<i64, PoolEntry>>,
}

impl QbClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_for(&self, instance: &InstanceRecord) -> Arc<QbClient> {
        let endpoint = (
            instance.host.clone(),
            instance.port,
            instance.username.clone(),
            instance.password.clone(),
        );
        let mut clients = self.clients.lock();
        match clients.get(&instance.id) {
            Some(entry) if entry.endpoint == endpoint => entry.client.clone(),
            _ => {
                let client = Arc::new(QbClient::new(
                    &instance.host,
                    instance.port as u16,
                    &instance.username,
                    &instance.password,
                ));
                clients.insert(
                    instance.id,
                    PoolEntry {
                        endpoint,
                        client: client.clone(),
                    },
                );
                client
            }
        }
    }

    /// Drops the cached client when an instance is deleted.
    pub fn remove(&self, instance_id: i64) {
        self.clients.lock().remove(&instance_id);
    }
}

impl ListerProvider for QbClientPool {
    fn lister_for(&self, instance: &InstanceRecord) -> Arc<dyn TorrentLister> {
        self.client_for(instance)
    }
}
