//! In-memory key-value backend for testing.

use crate::backend::{BatchOp, KvBackend, WriteBatch};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory key-value backend.
///
/// This backend stores all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral sessions that don't need persistence
///
/// It can be switched into an "unavailable" mode where every call fails,
/// which lets tests exercise the store-unavailable paths of the engine.
///
/// # Example
///
/// ```rust
/// use heka_storage::{KvBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.put("anchor.steps", b"token").unwrap();
/// assert_eq!(backend.get("anchor.steps").unwrap(), Some(b"token".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing entries.
    #[must_use]
    pub fn with_entries(entries: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            data: RwLock::new(entries),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Returns a copy of every entry in the backend.
    ///
    /// Useful for asserting that a store is byte-identical before and after
    /// an operation.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.data.read().clone()
    }

    /// Makes every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Clears all data from the backend.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl KvBackend for InMemoryBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        self.check_available()?;
        // A single write guard makes the whole batch visible at once.
        let mut data = self.data.write();
        apply_ops(&mut data, batch.into_ops());
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

pub(crate) fn apply_ops(data: &mut BTreeMap<String, Vec<u8>>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}
