//! Error types for the sync engine.

use heka_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// None of these cross the public callback API: the orchestrator converts
/// every error into a cycle-local "no progress" outcome.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A source adapter failed to fetch. Non-fatal to the cycle.
    #[error("fetch failed for source {source_id}: {message}")]
    SourceFetch {
        /// Source that failed.
        source_id: String,
        /// Error message.
        message: String,
    },

    /// No adapter is registered for a configured source.
    #[error("no adapter registered for source {0}")]
    UnknownSource(String),

    /// Upload failed or was rejected by the collector.
    #[error("upload failed: {message}")]
    Upload {
        /// Error message.
        message: String,
        /// Whether the upload can be retried.
        retryable: bool,
    },

    /// The checkpoint/credential store could not be read or written.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StorageError),

    /// The platform denied access to the requested sources.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// No credentials are stored; syncing is suppressed.
    #[error("not connected")]
    NotConnected,

    /// The batch could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The serialized batch could not be spooled to disk.
    #[error("spool error: {0}")]
    Spool(#[source] std::io::Error),

    /// A fetch or upload did not finish in time.
    #[error("operation timed out")]
    Timeout,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A sync task panicked or was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Creates a source fetch error.
    pub fn source_fetch(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceFetch {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Creates a retryable upload error (network failure, 5xx).
    pub fn upload_retryable(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable upload error (rejected request).
    pub fn upload_fatal(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Upload { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }
}
