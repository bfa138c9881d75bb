//! Single-flight sync cycles.

use crate::batch::{encode_batch, BatchSpool};
use crate::checkpoint::CheckpointStore;
use crate::collector::{Collector, SourceFailure};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::source::SourceRegistry;
use crate::state::{InFlight, StateCell, SyncCycleReport, SyncOutcome, SyncState, SyncStats};
use crate::types::Credentials;
use crate::uploader::Uploader;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Drives collect, serialize, upload and commit, one cycle at a time.
///
/// A sync request that arrives while a cycle is running completes immediately
/// with [`SyncOutcome::AlreadyRunning`]. Checkpoints are committed only after
/// the uploader confirms delivery; every other path leaves the store untouched.
pub struct SyncOrchestrator {
    config: SyncConfig,
    store: Arc<CheckpointStore>,
    collector: Collector,
    uploader: Arc<dyn Uploader>,
    spool: Option<BatchSpool>,
    state: StateCell,
    stats: RwLock<SyncStats>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator. Opens the spool directory if one is configured.
    pub fn new(
        config: SyncConfig,
        store: Arc<CheckpointStore>,
        registry: Arc<SourceRegistry>,
        uploader: Arc<dyn Uploader>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let spool = config.spool_dir.clone().map(BatchSpool::open).transpose()?;
        let collector = Collector::new(
            registry,
            store.clone(),
            config.lookback_delta()?,
            config.fetch_timeout,
        );
        Ok(Self {
            config,
            store,
            collector,
            uploader,
            spool,
            state: StateCell::default(),
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        self.state.load()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the checkpoint store.
    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Returns the collector.
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Runs one cycle anchored at now.
    pub async fn sync(&self) -> SyncOutcome {
        self.sync_as_of(Utc::now()).await
    }

    /// Runs one cycle anchored at `as_of`, unless one is already running.
    pub async fn sync_as_of(&self, as_of: DateTime<Utc>) -> SyncOutcome {
        let Some(flight) = self.begin() else {
            return SyncOutcome::AlreadyRunning;
        };
        let outcome = self.run_guarded(as_of).await;
        drop(flight);
        outcome
    }

    /// Starts a cycle on `runtime` and reports its outcome to `on_complete`.
    ///
    /// If a cycle is already running, `on_complete` is called before this
    /// returns. Otherwise it is called from the runtime once the cycle is over
    /// and the state is back to Idle. It is called exactly once either way.
    pub fn trigger_sync<F>(self: &Arc<Self>, runtime: &Handle, on_complete: F)
    where
        F: FnOnce(SyncOutcome) + Send + 'static,
    {
        let Some(flight) = self.begin() else {
            on_complete(SyncOutcome::AlreadyRunning);
            return;
        };
        let this = Arc::clone(self);
        runtime.spawn(async move {
            let outcome = this.run_guarded(Utc::now()).await;
            drop(flight);
            on_complete(outcome);
        });
    }

    fn begin(&self) -> Option<InFlight> {
        let flight = self.state.try_begin();
        if flight.is_none() {
            self.stats.write().triggers_coalesced += 1;
            info!("sync already in progress, request dropped");
        }
        flight
    }

    async fn run_guarded(&self, as_of: DateTime<Utc>) -> SyncOutcome {
        match AssertUnwindSafe(self.run_cycle(as_of)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("sync cycle panicked");
                self.failed(SyncError::Internal("sync cycle panicked".into()), Vec::new())
            }
        }
    }

    async fn run_cycle(&self, as_of: DateTime<Utc>) -> SyncOutcome {
        let started = Instant::now();
        self.stats.write().cycles_started += 1;

        let Some(credentials) = self.store.credentials() else {
            info!("not connected, skipping sync");
            return SyncOutcome::NotConnected;
        };

        info!(sources = self.config.sources.len(), %as_of, "sync cycle started");
        let collection = self.collector.collect_all(&self.config.sources, as_of).await;

        if collection.batch.is_empty() {
            info!(failed = collection.failures.len(), "nothing to upload");
            self.stats.write().cycles_empty += 1;
            return SyncOutcome::NothingToUpload {
                failed_sources: collection.failures,
            };
        }

        let payload = match encode_batch(&collection.batch) {
            Ok(payload) => payload,
            Err(e) => return self.failed(e, collection.failures),
        };

        // Removed on every exit path below when dropped.
        let _spooled = match self.spool.as_ref().map(|s| s.write(&payload)).transpose() {
            Ok(spooled) => spooled,
            Err(e) => return self.failed(e, collection.failures),
        };

        let (result, attempts) = self.upload_with_retry(&payload, &credentials).await;
        match result {
            Ok(true) => {}
            Ok(false) => {
                return self.failed(
                    SyncError::upload_fatal("collector refused the batch"),
                    collection.failures,
                )
            }
            Err(e) => return self.failed(e, collection.failures),
        }

        let checkpoints_committed = match self.store.commit_pending(&collection.pending) {
            Ok(()) => true,
            Err(e) => {
                // Delivered but not recorded: the next cycle re-sends these records.
                warn!(error = %e, "upload succeeded but checkpoints were not stored");
                false
            }
        };
        if let Err(e) = self.store.mark_first_upload(as_of) {
            warn!(error = %e, "failed to record upload time");
        }

        let report = SyncCycleReport {
            as_of,
            records_per_source: collection.batch.counts(),
            failed_sources: collection.failures,
            checkpoints_committed,
            upload_attempts: attempts,
            duration: started.elapsed(),
        };
        {
            let mut stats = self.stats.write();
            stats.cycles_uploaded += 1;
            stats.records_uploaded += report.records_uploaded() as u64;
            stats.last_success_at = Some(as_of);
            stats.last_error = None;
        }
        info!(
            records = report.records_uploaded(),
            committed = checkpoints_committed,
            elapsed_ms = report.duration.as_millis() as u64,
            "sync cycle uploaded"
        );
        SyncOutcome::Uploaded(report)
    }

    async fn upload_with_retry(
        &self,
        payload: &[u8],
        credentials: &Credentials,
    ) -> (SyncResult<bool>, u32) {
        let retry = &self.config.upload_retry;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = retry.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying upload");
                tokio::time::sleep(delay).await;
                self.stats.write().upload_retries += 1;
            }
            let result = self.uploader.upload(payload, credentials).await;
            attempt += 1;
            match result {
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    warn!(attempt, error = %e, "upload failed");
                }
                other => return (other, attempt),
            }
        }
    }

    fn failed(&self, error: SyncError, failed_sources: Vec<SourceFailure>) -> SyncOutcome {
        error!(error = %error, "sync cycle failed, checkpoints left unchanged");
        {
            let mut stats = self.stats.write();
            stats.cycles_failed += 1;
            stats.last_error = Some(error.to_string());
        }
        SyncOutcome::Failed {
            error,
            failed_sources,
        }
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("state", &self.state())
            .field("sources", &self.config.sources)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;
    use crate::types::{PendingCheckpointSet, Record, SourceId};
    use crate::uploader::{MockUploader, UploadBehavior};
    use crate::RetryConfig;
    use chrono::TimeZone;
    use heka_storage::InMemoryBackend;
    use std::time::Duration;

    struct Harness {
        backend: Arc<InMemoryBackend>,
        store: Arc<CheckpointStore>,
        steps: Arc<MockSource>,
        calories: Arc<MockSource>,
        uploader: Arc<MockUploader>,
        orchestrator: Arc<SyncOrchestrator>,
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn three_records(prefix: &str) -> Vec<Record> {
        (0..3)
            .map(|i| {
                Record::quantity(
                    format!("{prefix}-{i}"),
                    10.0 * (i + 1) as f64,
                    at(-3_600 + i * 60),
                    at(-3_600 + i * 60 + 59),
                )
            })
            .collect()
    }

    fn harness_with(uploader: MockUploader, config: SyncConfig) -> Harness {
        let backend = Arc::new(InMemoryBackend::new());
        let store = Arc::new(CheckpointStore::new(backend.clone(), &config.namespace));
        store.mark_connected("key", "user", None).unwrap();

        let steps = Arc::new(MockSource::with_records(three_records("steps")));
        let calories = Arc::new(MockSource::with_records(three_records("calories")));
        let registry = SourceRegistry::new()
            .with("steps", steps.clone())
            .with("calories", calories.clone());
        let uploader = Arc::new(uploader);
        let orchestrator = Arc::new(
            SyncOrchestrator::new(config, store.clone(), Arc::new(registry), uploader.clone())
                .unwrap(),
        );
        Harness {
            backend,
            store,
            steps,
            calories,
            uploader,
            orchestrator,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::new(vec![SourceId::from("steps"), SourceId::from("calories")])
    }

    fn harness(uploader: MockUploader) -> Harness {
        harness_with(uploader, config())
    }

    #[tokio::test]
    async fn successful_cycle_commits_checkpoints() {
        let h = harness(MockUploader::new());

        let outcome = h.orchestrator.sync_as_of(at(0)).await;
        assert!(outcome.is_success());
        let report = outcome.report().unwrap();
        assert_eq!(report.records_uploaded(), 6);
        assert!(report.checkpoints_committed);

        assert_eq!(
            h.store.get_checkpoint(&"steps".into()),
            Some(MockSource::checkpoint_at(3))
        );
        assert_eq!(
            h.store.get_checkpoint(&"calories".into()),
            Some(MockSource::checkpoint_at(3))
        );
        assert_eq!(h.store.last_sync_date(), Some(at(0)));
        assert_eq!(h.orchestrator.state(), SyncState::Idle);

        let payload = h.uploader.last_payload_json().unwrap();
        assert_eq!(payload["steps"].as_array().unwrap().len(), 3);
        assert_eq!(payload["calories"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_upload_leaves_store_untouched() {
        let h = harness(MockUploader::with_default(UploadBehavior::Fail {
            retryable: true,
        }));
        let before = h.backend.snapshot();

        let outcome = h.orchestrator.sync_as_of(at(0)).await;
        assert!(!outcome.is_success());
        assert!(matches!(outcome.error(), Some(SyncError::Upload { .. })));
        assert_eq!(h.backend.snapshot(), before);
        assert_eq!(h.orchestrator.stats().cycles_failed, 1);
        assert_eq!(h.orchestrator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn rejected_upload_leaves_store_untouched() {
        let h = harness(MockUploader::with_default(UploadBehavior::Reject));
        let before = h.backend.snapshot();

        let outcome = h.orchestrator.sync_as_of(at(0)).await;
        assert!(!outcome.is_success());
        assert_eq!(h.backend.snapshot(), before);
    }

    #[tokio::test]
    async fn empty_sources_skip_upload() {
        let h = harness(MockUploader::new());
        let mut pending = PendingCheckpointSet::new();
        pending.insert("steps".into(), MockSource::checkpoint_at(3));
        pending.insert("calories".into(), MockSource::checkpoint_at(3));
        h.store.commit_pending(&pending).unwrap();
        let before = h.backend.snapshot();

        let outcome = h.orchestrator.sync_as_of(at(0)).await;
        assert!(matches!(outcome, SyncOutcome::NothingToUpload { .. }));
        assert_eq!(h.uploader.attempts(), 0);
        assert_eq!(h.backend.snapshot(), before);
        assert_eq!(h.orchestrator.state(), SyncState::Idle);
        assert_eq!(h.orchestrator.stats().cycles_empty, 1);
    }

    #[tokio::test]
    async fn failing_source_keeps_its_checkpoint() {
        let h = harness(MockUploader::new());
        h.calories.set_failing(true);

        let outcome = h.orchestrator.sync_as_of(at(0)).await;
        let report = outcome.report().unwrap();
        assert_eq!(report.failed_sources.len(), 1);
        assert_eq!(report.failed_sources[0].source_id, SourceId::from("calories"));

        assert!(h.store.get_checkpoint(&"steps".into()).is_some());
        assert!(h.store.get_checkpoint(&"calories".into()).is_none());
    }

    #[tokio::test]
    async fn not_connected_skips_collection() {
        let h = harness(MockUploader::new());
        h.store.mark_disconnected().unwrap();

        let outcome = h.orchestrator.sync_as_of(at(0)).await;
        assert!(matches!(outcome, SyncOutcome::NotConnected));
        assert_eq!(h.steps.fetch_count(), 0);
        assert_eq!(h.uploader.attempts(), 0);
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_within_cycle() {
        let h = harness_with(
            MockUploader::new(),
            config().with_upload_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(1))
                    .without_jitter(),
            ),
        );
        h.uploader.push_behavior(UploadBehavior::Fail { retryable: true });

        let outcome = h.orchestrator.sync_as_of(at(0)).await;
        assert_eq!(outcome.report().unwrap().upload_attempts, 2);
        assert_eq!(h.orchestrator.stats().upload_retries, 1);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let h = harness_with(
            MockUploader::new(),
            config().with_upload_retry(RetryConfig::new(3).without_jitter()),
        );
        h.uploader.push_behavior(UploadBehavior::Fail { retryable: false });

        let outcome = h.orchestrator.sync_as_of(at(0)).await;
        assert!(!outcome.is_success());
        assert_eq!(h.uploader.attempts(), 1);
    }

    /// Accepts the upload, then takes the store offline.
    struct StoreKillingUploader(Arc<InMemoryBackend>);

    #[async_trait::async_trait]
    impl Uploader for StoreKillingUploader {
        async fn upload(&self, _payload: &[u8], _credentials: &Credentials) -> SyncResult<bool> {
            self.0.set_unavailable(true);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn commit_failure_still_reports_delivery() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = Arc::new(CheckpointStore::new(backend.clone(), ""));
        store.mark_connected("key", "user", None).unwrap();
        let registry = SourceRegistry::new().with(
            "steps",
            Arc::new(MockSource::with_records(three_records("steps"))),
        );
        let orchestrator = SyncOrchestrator::new(
            SyncConfig::new(vec![SourceId::from("steps")]),
            store.clone(),
            Arc::new(registry),
            Arc::new(StoreKillingUploader(backend.clone())),
        )
        .unwrap();

        let outcome = orchestrator.sync_as_of(at(0)).await;
        assert!(outcome.is_success());
        assert!(!outcome.report().unwrap().checkpoints_committed);

        backend.set_unavailable(false);
        assert!(store.get_checkpoint(&"steps".into()).is_none());
        assert_eq!(orchestrator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn concurrent_request_is_dropped() {
        let h = harness(MockUploader::paused());

        let running = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.sync_as_of(at(0)).await })
        };
        h.uploader.wait_started().await;
        assert_eq!(h.orchestrator.state(), SyncState::InProgress);

        let second = h.orchestrator.sync_as_of(at(1)).await;
        assert!(matches!(second, SyncOutcome::AlreadyRunning));
        assert_eq!(h.steps.fetch_count(), 1);

        h.uploader.release(1);
        assert!(running.await.unwrap().is_success());
        assert_eq!(h.uploader.attempts(), 1);
        assert_eq!(h.orchestrator.stats().triggers_coalesced, 1);
        assert_eq!(h.orchestrator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn trigger_sync_reports_once() {
        let h = harness(MockUploader::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        h.orchestrator
            .trigger_sync(&Handle::current(), move |outcome| {
                let _ = tx.send(outcome.is_success());
            });
        assert!(rx.await.unwrap());
        assert_eq!(h.orchestrator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn spool_file_removed_after_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness_with(
            MockUploader::with_default(UploadBehavior::Fail { retryable: true }),
            config().with_spool_dir(dir.path()),
        );
        h.orchestrator.sync_as_of(at(0)).await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        h.uploader.set_default(UploadBehavior::Accept);
        assert!(h.orchestrator.sync_as_of(at(1)).await.is_success());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
