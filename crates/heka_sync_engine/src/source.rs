//! Source adapter abstraction.

use crate::error::{SyncError, SyncResult};
use crate::types::{Checkpoint, FetchWindow, Record, RecordValue, SourceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What one fetch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    /// Records newer than the checkpoint, in source order.
    pub records: Vec<Record>,
    /// Checkpoint to commit once these records are delivered.
    pub checkpoint: Checkpoint,
}

/// A platform data source that can be read incrementally.
///
/// Implementations wrap the platform query API for one data type. They must
/// return a checkpoint even when no new records exist, and must treat an
/// unrecognized checkpoint as absent.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetches records after `checkpoint` (or within `window` when absent).
    async fn fetch(
        &self,
        checkpoint: Option<Checkpoint>,
        window: FetchWindow,
    ) -> SyncResult<FetchResult>;

    /// Sums the source's values over `[start, end)`.
    ///
    /// Returns `Ok(None)` when the source does not support aggregation.
    async fn aggregate(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> SyncResult<Option<f64>> {
        Ok(None)
    }
}

/// Registered adapters, keyed by source.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: BTreeMap<SourceId, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, returning the one it replaced.
    pub fn register(
        &mut self,
        source_id: impl Into<SourceId>,
        adapter: Arc<dyn SourceAdapter>,
    ) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.insert(source_id.into(), adapter)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, source_id: impl Into<SourceId>, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(source_id, adapter);
        self
    }

    /// Adapter registered for `source_id`.
    pub fn get(&self, source_id: &SourceId) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_id).cloned()
    }

    /// Returns true if an adapter is registered for `source_id`.
    pub fn contains(&self, source_id: &SourceId) -> bool {
        self.adapters.contains_key(source_id)
    }

    /// Registered source ids.
    pub fn ids(&self) -> Vec<SourceId> {
        self.adapters.keys().cloned().collect()
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.ids())
            .finish()
    }
}

/// A fetch observed by [`MockSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    /// Checkpoint passed in.
    pub checkpoint: Option<Checkpoint>,
    /// Window passed in.
    pub window: FetchWindow,
}

/// An in-memory anchored source for testing.
///
/// Records are appended to a log; the checkpoint is the log position encoded
/// as 8 big-endian bytes. Without a checkpoint, only records ending at or after
/// the window start are returned.
pub struct MockSource {
    log: RwLock<Vec<Record>>,
    queued_failures: Mutex<VecDeque<String>>,
    failing: AtomicBool,
    panic_next: AtomicBool,
    aggregate_supported: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl MockSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self {
            log: RwLock::new(Vec::new()),
            queued_failures: Mutex::new(VecDeque::new()),
            failing: AtomicBool::new(false),
            panic_next: AtomicBool::new(false),
            aggregate_supported: AtomicBool::new(true),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Creates a source holding `records`.
    pub fn with_records(records: Vec<Record>) -> Self {
        let source = Self::new();
        source.extend(records);
        source
    }

    /// Appends a record.
    pub fn push(&self, record: Record) {
        self.log.write().push(record);
    }

    /// Appends records.
    pub fn extend(&self, records: impl IntoIterator<Item = Record>) {
        self.log.write().extend(records);
    }

    /// Number of records in the log.
    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }

    /// Fails the next fetch with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.queued_failures.lock().push_back(message.into());
    }

    /// Fails every fetch and aggregate until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Panics inside the next fetch.
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    /// Makes `aggregate` return `Ok(None)`.
    pub fn set_aggregate_supported(&self, supported: bool) {
        self.aggregate_supported.store(supported, Ordering::SeqCst);
    }

    /// Delays every fetch.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Fetches observed so far.
    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    /// Number of fetches observed so far.
    pub fn fetch_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Encodes a log position as a checkpoint.
    pub fn checkpoint_at(position: usize) -> Checkpoint {
        Checkpoint::from_bytes((position as u64).to_be_bytes().to_vec())
    }

    /// Decodes a checkpoint produced by this source.
    pub fn position_of(checkpoint: &Checkpoint) -> Option<usize> {
        let bytes: [u8; 8] = checkpoint.as_bytes().try_into().ok()?;
        usize::try_from(u64::from_be_bytes(bytes)).ok()
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for MockSource {
    async fn fetch(
        &self,
        checkpoint: Option<Checkpoint>,
        window: FetchWindow,
    ) -> SyncResult<FetchResult> {
        self.calls.lock().push(FetchCall {
            checkpoint: checkpoint.clone(),
            window,
        });

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("mock source panicked during fetch");
        }
        if let Some(message) = self.queued_failures.lock().pop_front() {
            return Err(SyncError::source_fetch("mock", message));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::source_fetch("mock", "source unavailable"));
        }

        let log = self.log.read();
        let position = checkpoint
            .as_ref()
            .and_then(Self::position_of)
            .filter(|p| *p <= log.len());
        let records = match position {
            Some(p) => log[p..].to_vec(),
            None => log
                .iter()
                .filter(|r| r.interval_end >= window.start)
                .cloned()
                .collect(),
        };

        Ok(FetchResult {
            records,
            checkpoint: Self::checkpoint_at(log.len()),
        })
    }

    async fn aggregate(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> SyncResult<Option<f64>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::source_fetch("mock", "source unavailable"));
        }
        if !self.aggregate_supported.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let total = self
            .log
            .read()
            .iter()
            .filter(|r| r.interval_start >= start && r.interval_start < end)
            .filter_map(|r| match r.value {
                RecordValue::Quantity { value } => Some(value),
                _ => None,
            })
            .sum();
        Ok(Some(total))
    }
}
