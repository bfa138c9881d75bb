//! # Heka Storage
//!
//! Key-value backend trait and implementations for Heka.
//!
//! This crate provides the lowest-level persistence used by the sync engine
//! for checkpoints and connection state. Backends are **opaque byte stores**
//! keyed by strings - they do not interpret the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple key-value stores (get, atomic write batch, prefix scan)
//! - No knowledge of checkpoints, credentials, or sync cycles
//! - Must be `Send + Sync` for concurrent access
//! - A write batch is visible all at once or not at all
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - Durable snapshot file with checksum and process lock
//! - [`EncryptedBackend`] - Wrapper that adds AES-256-GCM encryption of values
//!
//! ## Example
//!
//! ```rust
//! use heka_storage::{KvBackend, InMemoryBackend, WriteBatch};
//!
//! let backend = InMemoryBackend::new();
//! let mut batch = WriteBatch::new();
//! batch.put("anchor.steps", b"a1".to_vec()).put("anchor.sleep", b"b1".to_vec());
//! backend.write_batch(batch).unwrap();
//! assert_eq!(backend.keys_with_prefix("anchor.").unwrap().len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod encrypted;
mod error;
mod file;
mod memory;

pub use backend::{BatchOp, KvBackend, WriteBatch};
pub use encrypted::{EncryptedBackend, EncryptionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;

use std::sync::Arc;

impl<T: KvBackend + ?Sized> KvBackend for Arc<T> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        (**self).write_batch(batch)
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        (**self).keys_with_prefix(prefix)
    }
}

impl<T: KvBackend + ?Sized> KvBackend for Box<T> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        (**self).write_batch(batch)
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        (**self).keys_with_prefix(prefix)
    }
}
