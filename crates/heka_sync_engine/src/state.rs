//! Sync state, statistics and cycle outcomes.

use crate::collector::SourceFailure;
use crate::error::SyncError;
use crate::types::SourceId;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Whether a sync cycle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    /// No cycle running.
    Idle = 0,
    /// A cycle is collecting or uploading.
    InProgress = 1,
}

impl SyncState {
    fn from_u8(raw: u8) -> Self {
        if raw == SyncState::InProgress as u8 {
            SyncState::InProgress
        } else {
            SyncState::Idle
        }
    }
}

/// Atomic holder of a [`SyncState`], shared with in-flight guards.
#[derive(Debug, Clone, Default)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn load(&self) -> SyncState {
        SyncState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves Idle to InProgress. Returns `None` if a cycle is already running.
    pub(crate) fn try_begin(&self) -> Option<InFlight> {
        self.0
            .compare_exchange(
                SyncState::Idle as u8,
                SyncState::InProgress as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()
            .map(|_| InFlight(self.0.clone()))
    }
}

/// Proof that this holder owns the running cycle. Returns the state to Idle on
/// drop, including during unwinding.
#[derive(Debug)]
pub(crate) struct InFlight(Arc<AtomicU8>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(SyncState::Idle as u8, Ordering::SeqCst);
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that entered InProgress.
    pub cycles_started: u64,
    /// Cycles whose upload was confirmed.
    pub cycles_uploaded: u64,
    /// Cycles that found nothing to upload.
    pub cycles_empty: u64,
    /// Cycles that ended without progress.
    pub cycles_failed: u64,
    /// Triggers dropped because a cycle was running.
    pub triggers_coalesced: u64,
    /// Records delivered across all cycles.
    pub records_uploaded: u64,
    /// Upload retries across all cycles.
    pub upload_retries: u64,
    /// Instant of the last confirmed upload.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Details of a cycle whose upload was confirmed.
#[derive(Debug, Clone)]
pub struct SyncCycleReport {
    /// Instant the cycle was anchored to.
    pub as_of: DateTime<Utc>,
    /// Records uploaded per source.
    pub records_per_source: BTreeMap<SourceId, usize>,
    /// Sources that failed and were left for the next cycle.
    pub failed_sources: Vec<SourceFailure>,
    /// Whether the new checkpoints were stored.
    pub checkpoints_committed: bool,
    /// Upload attempts made, including the first.
    pub upload_attempts: u32,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl SyncCycleReport {
    /// Total records uploaded.
    pub fn records_uploaded(&self) -> usize {
        self.records_per_source.values().sum()
    }
}

/// How a sync request ended.
#[derive(Debug)]
pub enum SyncOutcome {
    /// The batch was delivered.
    Uploaded(SyncCycleReport),
    /// No source returned records; nothing was uploaded or committed.
    NothingToUpload {
        /// Sources that failed.
        failed_sources: Vec<SourceFailure>,
    },
    /// Another cycle was running; this request did nothing.
    AlreadyRunning,
    /// No credentials are stored.
    NotConnected,
    /// The cycle made no progress.
    Failed {
        /// Cause.
        error: SyncError,
        /// Sources that failed before the cause.
        failed_sources: Vec<SourceFailure>,
    },
}

impl SyncOutcome {
    /// Value reported to completion callbacks.
    ///
    /// True when no data is waiting on this request: the batch was delivered
    /// or there was nothing to deliver.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SyncOutcome::Uploaded(_) | SyncOutcome::NothingToUpload { .. }
        )
    }

    /// The report, if the batch was delivered.
    pub fn report(&self) -> Option<&SyncCycleReport> {
        match self {
            SyncOutcome::Uploaded(report) => Some(report),
            _ => None,
        }
    }

    /// The error, if the cycle failed.
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            SyncOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}
