//! Change-notification triggers.
//!
//! The host platform calls back whenever a watched source has new data. Each
//! callback carries an acknowledgement that must be invoked exactly once so the
//! platform can schedule the next delivery.

use crate::checkpoint::CheckpointStore;
use crate::error::SyncResult;
use crate::orchestrator::SyncOrchestrator;
use crate::types::SourceId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Acknowledges one change notification.
pub type Ack = Box<dyn FnOnce() + Send + 'static>;

/// Called by the platform with an optional delivery error and an [`Ack`].
pub type ObserverCallback = Arc<dyn Fn(&SourceId, Option<String>, Ack) + Send + Sync>;

/// Platform registry of change observers.
pub trait ObserverPlatform: Send + Sync {
    /// Registers `callback` for changes to `source_id`.
    fn register_observer(&self, source_id: &SourceId, callback: ObserverCallback) -> SyncResult<()>;

    /// Asks the platform to wake the process for changes to `source_id`.
    fn enable_background_delivery(&self, source_id: &SourceId) -> SyncResult<()>;
}

/// Turns change notifications into sync requests.
pub struct TriggerHandler {
    orchestrator: Arc<SyncOrchestrator>,
    store: Arc<CheckpointStore>,
    runtime: Handle,
}

impl TriggerHandler {
    /// Creates a handler that runs cycles on `runtime`.
    pub fn new(orchestrator: Arc<SyncOrchestrator>, runtime: Handle) -> Self {
        let store = orchestrator.store().clone();
        Self {
            orchestrator,
            store,
            runtime,
        }
    }

    /// Handles one notification.
    ///
    /// Delivery errors and notifications while disconnected are acknowledged
    /// at once. Otherwise a sync is requested and `ack` runs when it completes,
    /// or at once if a cycle is already running.
    pub fn on_change(&self, source_id: &SourceId, error: Option<String>, ack: Ack) {
        if let Some(error) = error {
            warn!(source = %source_id, %error, "observer delivered an error");
            ack();
            return;
        }
        if !self.store.is_connected() {
            debug!(source = %source_id, "change ignored, not connected");
            ack();
            return;
        }

        let source = source_id.clone();
        self.orchestrator
            .trigger_sync(&self.runtime, move |outcome| {
                debug!(source = %source, success = outcome.is_success(), "triggered sync finished");
                ack();
            });
    }
}

/// Installs observers and background delivery once per source.
pub struct TriggerHub {
    platform: Arc<dyn ObserverPlatform>,
    observed: Mutex<BTreeSet<SourceId>>,
    background: Mutex<BTreeSet<SourceId>>,
}

impl TriggerHub {
    /// Creates a hub for `platform`.
    pub fn new(platform: Arc<dyn ObserverPlatform>) -> Self {
        Self {
            platform,
            observed: Mutex::new(BTreeSet::new()),
            background: Mutex::new(BTreeSet::new()),
        }
    }

    /// Registers observers and background delivery for `sources`.
    ///
    /// Sources already installed are skipped. A failure for one source is
    /// logged and does not prevent the others. Returns the number of newly
    /// registered observers.
    pub fn install(&self, sources: &[SourceId], handler: Arc<TriggerHandler>) -> usize {
        let mut installed = 0;
        for source_id in sources {
            if self.install_observer(source_id, &handler) {
                installed += 1;
            }
            self.enable_background_delivery(source_id);
        }
        installed
    }

    /// Sources with a registered observer.
    pub fn observed(&self) -> Vec<SourceId> {
        self.observed.lock().iter().cloned().collect()
    }

    fn install_observer(&self, source_id: &SourceId, handler: &Arc<TriggerHandler>) -> bool {
        let mut observed = self.observed.lock();
        if observed.contains(source_id) {
            return false;
        }
        let handler = Arc::clone(handler);
        let callback: ObserverCallback =
            Arc::new(move |source: &SourceId, error: Option<String>, ack: Ack| {
                handler.on_change(source, error, ack)
            });
        match self.platform.register_observer(source_id, callback) {
            Ok(()) => {
                info!(source = %source_id, "observer installed");
                observed.insert(source_id.clone());
                true
            }
            Err(e) => {
                warn!(source = %source_id, error = %e, "observer registration failed");
                false
            }
        }
    }

    fn enable_background_delivery(&self, source_id: &SourceId) {
        let mut background = self.background.lock();
        if background.contains(source_id) {
            return;
        }
        match self.platform.enable_background_delivery(source_id) {
            Ok(()) => {
                debug!(source = %source_id, "background delivery enabled");
                background.insert(source_id.clone());
            }
            Err(e) => warn!(source = %source_id, error = %e, "background delivery failed"),
        }
    }
}

/// An in-process observer platform for testing.
///
/// [`fire`](Self::fire) simulates a platform notification and resolves once
/// the notification has been acknowledged.
#[derive(Default)]
pub struct MockObserverPlatform {
    observers: Mutex<Vec<(SourceId, ObserverCallback)>>,
    background: Mutex<Vec<SourceId>>,
}

impl MockObserverPlatform {
    /// Creates a platform with no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `register_observer` calls received.
    pub fn registrations(&self) -> usize {
        self.observers.lock().len()
    }

    /// Sources for which background delivery was requested, in call order.
    pub fn background_requests(&self) -> Vec<SourceId> {
        self.background.lock().clone()
    }

    /// Delivers a notification for `source_id` to every matching observer.
    ///
    /// Returns one receiver per observer that completes when it acknowledges.
    pub fn fire(
        &self,
        source_id: &SourceId,
        error: Option<String>,
    ) -> Vec<tokio::sync::oneshot::Receiver<()>> {
        let callbacks: Vec<ObserverCallback> = self
            .observers
            .lock()
            .iter()
            .filter(|(id, _)| id == source_id)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        callbacks
            .into_iter()
            .map(|callback| {
                let (tx, rx) = tokio::sync::oneshot::channel();
                let ack: Ack = Box::new(move || {
                    let _ = tx.send(());
                });
                callback(source_id, error.clone(), ack);
                rx
            })
            .collect()
    }
}

impl ObserverPlatform for MockObserverPlatform {
    fn register_observer(&self, source_id: &SourceId, callback: ObserverCallback) -> SyncResult<()> {
        self.observers.lock().push((source_id.clone(), callback));
        Ok(())
    }

    fn enable_background_delivery(&self, source_id: &SourceId) -> SyncResult<()> {
        self.background.lock().push(source_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::source::{MockSource, SourceRegistry};
    use crate::types::Record;
    use crate::uploader::MockUploader;
    use chrono::{Duration, Utc};
    use heka_storage::InMemoryBackend;

    struct Fixture {
        platform: Arc<MockObserverPlatform>,
        hub: TriggerHub,
        handler: Arc<TriggerHandler>,
        store: Arc<CheckpointStore>,
        steps: Arc<MockSource>,
        uploader: Arc<MockUploader>,
    }

    fn fixture(uploader: MockUploader) -> Fixture {
        let store = Arc::new(CheckpointStore::new(Arc::new(InMemoryBackend::new()), ""));
        let now = Utc::now();
        let steps = Arc::new(MockSource::with_records(vec![Record::quantity(
            "s-1",
            120.0,
            now - Duration::minutes(10),
            now - Duration::minutes(5),
        )]));
        let registry = SourceRegistry::new().with("steps", steps.clone());
        let uploader = Arc::new(uploader);
        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                SyncConfig::new(vec![SourceId::from("steps")]),
                store.clone(),
                Arc::new(registry),
                uploader.clone(),
            )
            .unwrap(),
        );
        let platform = Arc::new(MockObserverPlatform::new());
        Fixture {
            hub: TriggerHub::new(platform.clone()),
            handler: Arc::new(TriggerHandler::new(orchestrator, Handle::current())),
            platform,
            store,
            steps,
            uploader,
        }
    }

    #[tokio::test]
    async fn install_is_idempotent() {
        let f = fixture(MockUploader::new());
        let sources = vec![SourceId::from("steps")];

        assert_eq!(f.hub.install(&sources, f.handler.clone()), 1);
        assert_eq!(f.hub.install(&sources, f.handler.clone()), 0);

        assert_eq!(f.platform.registrations(), 1);
        assert_eq!(f.platform.background_requests(), sources);
        assert_eq!(f.hub.observed(), sources);
    }

    #[tokio::test]
    async fn disconnected_change_is_acked_without_sync() {
        let f = fixture(MockUploader::new());
        f.hub.install(&[SourceId::from("steps")], f.handler.clone());

        for ack in f.platform.fire(&"steps".into(), None) {
            ack.await.unwrap();
        }
        assert_eq!(f.steps.fetch_count(), 0);
        assert_eq!(f.uploader.attempts(), 0);
    }

    #[tokio::test]
    async fn delivery_error_is_acked_without_sync() {
        let f = fixture(MockUploader::new());
        f.store.mark_connected("key", "user", None).unwrap();
        f.hub.install(&[SourceId::from("steps")], f.handler.clone());

        for ack in f
            .platform
            .fire(&"steps".into(), Some("query failed".into()))
        {
            ack.await.unwrap();
        }
        assert_eq!(f.steps.fetch_count(), 0);
    }

    #[tokio::test]
    async fn connected_change_syncs_then_acks() {
        let f = fixture(MockUploader::new());
        f.store.mark_connected("key", "user", None).unwrap();
        f.hub.install(&[SourceId::from("steps")], f.handler.clone());

        let acks = f.platform.fire(&"steps".into(), None);
        assert_eq!(acks.len(), 1);
        for ack in acks {
            ack.await.unwrap();
        }
        assert_eq!(f.uploader.attempts(), 1);
        assert!(f.store.get_checkpoint(&"steps".into()).is_some());
    }

    #[tokio::test]
    async fn change_during_cycle_is_acked_immediately() {
        let f = fixture(MockUploader::paused());
        f.store.mark_connected("key", "user", None).unwrap();
        f.hub.install(&[SourceId::from("steps")], f.handler.clone());

        let mut first = f.platform.fire(&"steps".into(), None);
        f.uploader.wait_started().await;

        for ack in f.platform.fire(&"steps".into(), None) {
            ack.await.unwrap();
        }
        assert_eq!(f.steps.fetch_count(), 1);

        f.uploader.release(1);
        first.remove(0).await.unwrap();
        assert_eq!(f.uploader.attempts(), 1);
    }
}
