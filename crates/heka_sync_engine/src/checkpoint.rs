//! Durable checkpoint and connection state.
//!
//! Layout inside the backend:
//!
//! - `<namespace>.hekaSDKData`: JSON connection record
//! - `<namespace>.hekaSDKData.anchor.<source_id>`: raw checkpoint bytes
//!
//! Checkpoints survive a disconnect; only the credentials and the first-upload
//! date are cleared.

use crate::error::SyncResult;
use crate::types::{
    Checkpoint, ConnectionState, ConnectionStatus, Credentials, PendingCheckpointSet, SourceId,
};
use chrono::{DateTime, Utc};
use heka_storage::{KvBackend, WriteBatch};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const RECORD_SUFFIX: &str = "hekaSDKData";
const ANCHOR_INFIX: &str = ".anchor.";

/// Persisted form of [`ConnectionState`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredConnection {
    #[serde(default)]
    api_key: String,
    #[serde(default, rename = "uuid")]
    user_id: String,
    #[serde(default)]
    connected: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    first_upload_date: Option<DateTime<Utc>>,
}

impl From<StoredConnection> for ConnectionState {
    fn from(stored: StoredConnection) -> Self {
        Self {
            status: if stored.connected {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            },
            api_key: stored.api_key,
            user_id: stored.user_id,
            first_upload: stored.first_upload_date,
        }
    }
}

/// Checkpoint and connection store over a key-value backend.
pub struct CheckpointStore {
    backend: Arc<dyn KvBackend>,
    record_key: String,
    anchor_prefix: String,
    // Serializes read-modify-write of the connection record.
    admin: Mutex<()>,
}

impl CheckpointStore {
    /// Creates a store. An empty namespace yields unprefixed keys.
    pub fn new(backend: Arc<dyn KvBackend>, namespace: &str) -> Self {
        let record_key = if namespace.is_empty() {
            RECORD_SUFFIX.to_string()
        } else {
            format!("{namespace}.{RECORD_SUFFIX}")
        };
        let anchor_prefix = format!("{record_key}{ANCHOR_INFIX}");
        Self {
            backend,
            record_key,
            anchor_prefix,
            admin: Mutex::new(()),
        }
    }

    /// Key holding the checkpoint of `source_id`.
    pub fn anchor_key(&self, source_id: &SourceId) -> String {
        format!("{}{}", self.anchor_prefix, source_id)
    }

    /// Key holding the connection record.
    pub fn record_key(&self) -> &str {
        &self.record_key
    }

    /// Returns the checkpoint of a source, or `None` for a full-history fetch.
    ///
    /// A backend failure is logged and treated as absent.
    pub fn get_checkpoint(&self, source_id: &SourceId) -> Option<Checkpoint> {
        match self.try_get_checkpoint(source_id) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(source = %source_id, error = %e, "checkpoint unreadable, fetching full window");
                None
            }
        }
    }

    /// Returns the checkpoint of a source, propagating backend failures.
    pub fn try_get_checkpoint(&self, source_id: &SourceId) -> SyncResult<Option<Checkpoint>> {
        Ok(self
            .backend
            .get(&self.anchor_key(source_id))?
            .map(Checkpoint::from_bytes))
    }

    /// Applies all pending checkpoints in one atomic backend write.
    pub fn commit_pending(&self, pending: &PendingCheckpointSet) -> SyncResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for (source_id, checkpoint) in pending.iter() {
            batch.put(self.anchor_key(source_id), checkpoint.as_bytes().to_vec());
        }
        self.backend.write_batch(batch)?;
        debug!(count = pending.len(), "committed checkpoints");
        Ok(())
    }

    /// All stored checkpoints, keyed by source.
    pub fn checkpoints(&self) -> SyncResult<BTreeMap<SourceId, Checkpoint>> {
        let mut out = BTreeMap::new();
        for key in self.backend.keys_with_prefix(&self.anchor_prefix)? {
            let Some(source) = key.strip_prefix(&self.anchor_prefix) else {
                continue;
            };
            if let Some(bytes) = self.backend.get(&key)? {
                out.insert(SourceId::new(source), Checkpoint::from_bytes(bytes));
            }
        }
        Ok(out)
    }

    /// Forgets the checkpoint of one source so its next fetch starts over.
    pub fn clear_checkpoint(&self, source_id: &SourceId) -> SyncResult<()> {
        self.backend.delete(&self.anchor_key(source_id))?;
        info!(source = %source_id, "checkpoint cleared");
        Ok(())
    }

    /// Current connection state. An unreadable record reads as disconnected.
    pub fn connection(&self) -> ConnectionState {
        match self.load_record() {
            Ok(stored) => stored.into(),
            Err(e) => {
                warn!(error = %e, "connection record unreadable, treating as disconnected");
                ConnectionState::default()
            }
        }
    }

    /// Returns true if connected.
    pub fn is_connected(&self) -> bool {
        self.connection().is_connected()
    }

    /// Upload credentials, if connected.
    pub fn credentials(&self) -> Option<Credentials> {
        self.connection().credentials()
    }

    /// First confirmed upload (or the host-supplied last sync date).
    pub fn last_sync_date(&self) -> Option<DateTime<Utc>> {
        self.connection().first_upload
    }

    /// Records the instant of a confirmed upload.
    pub fn mark_first_upload(&self, at: DateTime<Utc>) -> SyncResult<()> {
        let _guard = self.admin.lock();
        let mut stored = self.load_record()?;
        stored.first_upload_date = Some(at);
        self.save_record(&stored)
    }

    /// Stores credentials and enables syncing.
    pub fn mark_connected(
        &self,
        api_key: &str,
        user_id: &str,
        last_sync_date: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        let _guard = self.admin.lock();
        let stored = StoredConnection {
            api_key: api_key.to_string(),
            user_id: user_id.to_string(),
            connected: true,
            first_upload_date: last_sync_date,
        };
        self.save_record(&stored)?;
        info!(user_id, "connected");
        Ok(())
    }

    /// Clears credentials and disables syncing. Checkpoints are kept.
    pub fn mark_disconnected(&self) -> SyncResult<()> {
        let _guard = self.admin.lock();
        self.save_record(&StoredConnection::default())?;
        info!("disconnected");
        Ok(())
    }

    fn load_record(&self) -> SyncResult<StoredConnection> {
        let Some(bytes) = self.backend.get(&self.record_key)? else {
            return Ok(StoredConnection::default());
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            heka_storage::StorageError::Corrupted(format!("connection record: {e}")).into()
        })
    }

    fn save_record(&self, stored: &StoredConnection) -> SyncResult<()> {
        let bytes = serde_json::to_vec(stored)
            .map_err(|e| crate::error::SyncError::Serialization(e.to_string()))?;
        self.backend.put(&self.record_key, &bytes)?;
        Ok(())
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("record_key", &self.record_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use heka_storage::InMemoryBackend;

    fn store() -> (Arc<InMemoryBackend>, CheckpointStore) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = CheckpointStore::new(backend.clone(), "com.example.app");
        (backend, store)
    }

    fn cp(bytes: &[u8]) -> Checkpoint {
        Checkpoint::from_bytes(bytes.to_vec())
    }

    #[test]
    fn key_layout() {
        let (_, store) = store();
        assert_eq!(store.record_key(), "com.example.app.hekaSDKData");
        assert_eq!(
            store.anchor_key(&"steps".into()),
            "com.example.app.hekaSDKData.anchor.steps"
        );

        let bare = CheckpointStore::new(Arc::new(InMemoryBackend::new()), "");
        assert_eq!(bare.record_key(), "hekaSDKData");
    }

    #[test]
    fn absent_checkpoint() {
        let (_, store) = store();
        assert!(store.get_checkpoint(&"steps".into()).is_none());
        assert!(store.checkpoints().unwrap().is_empty());
    }

    #[test]
    fn commit_pending_applies_all() {
        let (backend, store) = store();
        let mut pending = PendingCheckpointSet::new();
        pending.insert("steps".into(), cp(b"s1"));
        pending.insert("sleep_analysis".into(), cp(b"z1"));

        store.commit_pending(&pending).unwrap();

        assert_eq!(store.get_checkpoint(&"steps".into()), Some(cp(b"s1")));
        let all = store.checkpoints().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get(&SourceId::from("sleep_analysis")), Some(&cp(b"z1")));
        assert_eq!(backend.snapshot().len(), 2);
    }

    #[test]
    fn empty_commit_does_not_write() {
        let (backend, store) = store();
        backend.set_unavailable(true);
        store.commit_pending(&PendingCheckpointSet::new()).unwrap();
    }

    #[test]
    fn unavailable_backend() {
        let (backend, store) = store();
        let mut pending = PendingCheckpointSet::new();
        pending.insert("steps".into(), cp(b"s1"));
        store.commit_pending(&pending).unwrap();

        backend.set_unavailable(true);
        assert!(store.get_checkpoint(&"steps".into()).is_none());
        assert!(matches!(
            store.commit_pending(&pending),
            Err(crate::SyncError::StoreUnavailable(_))
        ));
        assert!(!store.is_connected());
    }

    #[test]
    fn connect_and_disconnect() {
        let (_, store) = store();
        assert!(!store.is_connected());
        assert!(store.credentials().is_none());

        let since = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        store.mark_connected("key-1", "user-1", Some(since)).unwrap();
        assert!(store.is_connected());
        assert_eq!(store.last_sync_date(), Some(since));
        let creds = store.credentials().unwrap();
        assert_eq!(creds.api_key, "key-1");
        assert_eq!(creds.user_id, "user-1");

        let mut pending = PendingCheckpointSet::new();
        pending.insert("steps".into(), cp(b"s1"));
        store.commit_pending(&pending).unwrap();

        store.mark_disconnected().unwrap();
        let state = store.connection();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.api_key.is_empty());
        assert!(state.first_upload.is_none());
        // Checkpoints are kept across disconnects.
        assert_eq!(store.get_checkpoint(&"steps".into()), Some(cp(b"s1")));
    }

    #[test]
    fn mark_first_upload_keeps_credentials() {
        let (_, store) = store();
        store.mark_connected("key", "user", None).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap();
        store.mark_first_upload(at).unwrap();

        let state = store.connection();
        assert!(state.is_connected());
        assert_eq!(state.api_key, "key");
        assert_eq!(state.first_upload, Some(at));
    }

    #[test]
    fn record_json_shape() {
        let (backend, store) = store();
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        store.mark_connected("key", "user", Some(at)).unwrap();

        let raw = backend.get(store.record_key()).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["apiKey"], "key");
        assert_eq!(json["uuid"], "user");
        assert_eq!(json["connected"], true);
        assert_eq!(json["firstUploadDate"], 1_700_000_000_000i64);
    }

    #[test]
    fn corrupted_record_reads_disconnected() {
        let (backend, store) = store();
        backend.put(store.record_key(), b"{not json").unwrap();
        assert!(!store.is_connected());
        assert!(store.mark_first_upload(Utc::now()).is_err());
    }

    #[test]
    fn clear_single_checkpoint() {
        let (_, store) = store();
        let mut pending = PendingCheckpointSet::new();
        pending.insert("steps".into(), cp(b"s1"));
        pending.insert("workout".into(), cp(b"w1"));
        store.commit_pending(&pending).unwrap();

        store.clear_checkpoint(&"steps".into()).unwrap();
        assert!(store.get_checkpoint(&"steps".into()).is_none());
        assert_eq!(store.get_checkpoint(&"workout".into()), Some(cp(b"w1")));
    }
}
