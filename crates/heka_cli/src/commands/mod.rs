//! CLI command implementations.

pub mod connection;
pub mod reset;
pub mod status;
pub mod sync;

use heka_storage::{EncryptedBackend, EncryptionKey, FileBackend, KvBackend, StorageError};
use heka_sync_engine::CheckpointStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Salt mixed into passphrase-derived store keys.
const PASSPHRASE_SALT: &[u8] = b"heka-cli-store";

/// Errors raised by the CLI itself.
#[derive(Debug, Error)]
pub enum CliError {
    /// The store could not be opened.
    #[error("cannot open store at {path}: {source}")]
    Store {
        /// Store path.
        path: PathBuf,
        /// Cause.
        #[source]
        source: StorageError,
    },

    /// A flag value is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A sync cycle did not deliver its batch.
    #[error("sync failed: {0}")]
    SyncFailed(String),
}

/// Opens the store file, creating parent directories as needed.
///
/// With a passphrase every value is encrypted at rest.
pub fn open_store(path: &Path, passphrase: Option<&str>) -> Result<Arc<dyn KvBackend>, CliError> {
    let store_error = |source| CliError::Store {
        path: path.to_path_buf(),
        source,
    };
    let file = FileBackend::open_with_create_dirs(path).map_err(store_error)?;
    match passphrase {
        Some(passphrase) => {
            let key = EncryptionKey::derive_from_passphrase(passphrase.as_bytes(), PASSPHRASE_SALT)
                .map_err(store_error)?;
            Ok(Arc::new(EncryptedBackend::new(file, key)))
        }
        None => Ok(Arc::new(file)),
    }
}

/// Wraps a backend in a checkpoint store.
pub fn checkpoint_store(backend: Arc<dyn KvBackend>, namespace: &str) -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::new(backend, namespace))
}
