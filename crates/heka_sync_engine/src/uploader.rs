//! Uploader abstraction.

use crate::error::{SyncError, SyncResult};
use crate::types::Credentials;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};

/// Delivers a serialized batch to the remote collector.
///
/// `Ok(true)` means the collector confirmed receipt. `Ok(false)` means it
/// answered but refused the batch. `Err` means the outcome is unknown.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Uploads one serialized batch.
    async fn upload(&self, payload: &[u8], credentials: &Credentials) -> SyncResult<bool>;
}

/// Scripted response of a [`MockUploader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadBehavior {
    /// Confirm receipt.
    Accept,
    /// Answer with a refusal.
    Reject,
    /// Fail with a transport error.
    Fail {
        /// Whether the error is retryable.
        retryable: bool,
    },
}

/// An upload observed by [`MockUploader`].
#[derive(Debug, Clone)]
pub struct UploadCall {
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Credentials sent along.
    pub credentials: Credentials,
}

/// A mock uploader for testing.
///
/// Replays queued behaviors in order, then falls back to a default. Can be
/// paused so a test can observe a cycle while it is uploading.
pub struct MockUploader {
    queued: Mutex<VecDeque<UploadBehavior>>,
    default: Mutex<UploadBehavior>,
    calls: Mutex<Vec<UploadCall>>,
    attempts: AtomicUsize,
    gate: Option<Semaphore>,
    started: Notify,
}

impl MockUploader {
    /// Creates an uploader that accepts everything.
    pub fn new() -> Self {
        Self::with_default(UploadBehavior::Accept)
    }

    /// Creates an uploader answering `behavior` when nothing is queued.
    pub fn with_default(behavior: UploadBehavior) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            default: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            gate: None,
            started: Notify::new(),
        }
    }

    /// Creates an accepting uploader that blocks each upload until
    /// [`release`](Self::release) is called.
    pub fn paused() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    /// Queues a behavior for the next upload.
    pub fn push_behavior(&self, behavior: UploadBehavior) {
        self.queued.lock().push_back(behavior);
    }

    /// Changes the fallback behavior.
    pub fn set_default(&self, behavior: UploadBehavior) {
        *self.default.lock() = behavior;
    }

    /// Lets `n` blocked uploads proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Waits until an upload has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Uploads observed so far.
    pub fn calls(&self) -> Vec<UploadCall> {
        self.calls.lock().clone()
    }

    /// Number of upload attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Last uploaded payload parsed as JSON.
    pub fn last_payload_json(&self) -> Option<serde_json::Value> {
        let calls = self.calls.lock();
        let last = calls.last()?;
        serde_json::from_slice(&last.payload).ok()
    }
}

impl Default for MockUploader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn upload(&self, payload: &[u8], credentials: &Credentials) -> SyncResult<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(UploadCall {
            payload: payload.to_vec(),
            credentials: credentials.clone(),
        });
        self.started.notify_one();

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| SyncError::upload_retryable("upload gate closed"))?;
            permit.forget();
        }

        let queued = self.queued.lock().pop_front();
        let behavior = queued.unwrap_or_else(|| *self.default.lock());
        match behavior {
            UploadBehavior::Accept => Ok(true),
            UploadBehavior::Reject => Ok(false),
            UploadBehavior::Fail { retryable: true } => {
                Err(SyncError::upload_retryable("mock network failure"))
            }
            UploadBehavior::Fail { retryable: false } => {
                Err(SyncError::upload_fatal("mock upload failure"))
            }
        }
    }
}
