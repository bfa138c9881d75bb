//! Host-facing API.
//!
//! Every operation comes in two forms: an `async` method for hosts that can
//! await, and a callback method that runs on the client's runtime and reports
//! a plain value exactly once. Neither form returns errors; failures are logged
//! and reported as `false` or `None`.

use crate::checkpoint::CheckpointStore;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::SyncOrchestrator;
use crate::source::{SourceAdapter, SourceRegistry};
use crate::state::SyncOutcome;
use crate::trigger::{ObserverPlatform, TriggerHandler, TriggerHub};
use crate::types::SourceId;
use crate::uploader::Uploader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heka_storage::KvBackend;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Platform permission prompt for reading sources.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Asks for read access to `sources`. `Ok(false)` means the user declined.
    async fn request_authorization(&self, sources: &[SourceId]) -> SyncResult<bool>;
}

/// Entry point for host applications.
///
/// Cheap to clone; clones share the same store, orchestrator and triggers.
#[derive(Clone)]
pub struct HekaClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    registry: Arc<SourceRegistry>,
    aggregate_sources: BTreeSet<SourceId>,
    store: Arc<CheckpointStore>,
    orchestrator: Arc<SyncOrchestrator>,
    authorizer: Arc<dyn Authorizer>,
    triggers: Option<TriggerHub>,
    handler: Arc<TriggerHandler>,
    runtime: Handle,
}

impl HekaClient {
    /// Starts building a client.
    pub fn builder(config: SyncConfig) -> HekaClientBuilder {
        HekaClientBuilder::new(config)
    }

    /// Returns the orchestrator.
    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.inner.orchestrator
    }

    /// Returns the checkpoint store.
    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.inner.store
    }

    /// Returns true if credentials are stored.
    pub fn is_connected(&self) -> bool {
        self.inner.store.is_connected()
    }

    /// Asks the platform for access to every registered source.
    pub async fn request_authorization_async(&self) -> bool {
        let sources = self.inner.registry.ids();
        match self.inner.authorizer.request_authorization(&sources).await {
            Ok(granted) => {
                info!(granted, sources = sources.len(), "authorization requested");
                granted
            }
            Err(e) => {
                warn!(error = %e, "authorization request failed");
                false
            }
        }
    }

    /// Callback form of [`request_authorization_async`](Self::request_authorization_async).
    pub fn request_authorization<F>(&self, on_complete: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let this = self.clone();
        self.spawn(async move { this.request_authorization_async().await }, on_complete);
    }

    /// Requests authorization, then stores credentials and enables syncing.
    ///
    /// `last_sync_date` seeds the lookback window for the first cycle.
    pub async fn connect_async(
        &self,
        api_key: &str,
        user_id: &str,
        last_sync_date: Option<DateTime<Utc>>,
    ) -> bool {
        if !self.request_authorization_async().await {
            warn!(
                error = %SyncError::AuthorizationDenied("read access not granted".into()),
                "connect aborted"
            );
            return false;
        }
        match self
            .inner
            .store
            .mark_connected(api_key, user_id, last_sync_date)
        {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to store credentials");
                false
            }
        }
    }

    /// Callback form of [`connect_async`](Self::connect_async).
    pub fn connect<F>(
        &self,
        api_key: impl Into<String>,
        user_id: impl Into<String>,
        last_sync_date: Option<DateTime<Utc>>,
        on_complete: F,
    ) where
        F: FnOnce(bool) + Send + 'static,
    {
        let this = self.clone();
        let api_key = api_key.into();
        let user_id = user_id.into();
        self.spawn(
            async move { this.connect_async(&api_key, &user_id, last_sync_date).await },
            on_complete,
        );
    }

    /// Clears credentials. Later triggers are acknowledged without syncing.
    ///
    /// Checkpoints are kept, so a reconnect resumes where syncing stopped.
    pub fn disconnect_now(&self) -> bool {
        match self.inner.store.mark_disconnected() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to clear credentials");
                false
            }
        }
    }

    /// Callback form of [`disconnect_now`](Self::disconnect_now).
    pub fn disconnect<F>(&self, on_complete: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        on_complete(self.disconnect_now());
    }

    /// Registers change observers and background delivery for the configured
    /// trigger sources. Repeated calls do nothing.
    pub fn install_triggers(&self) -> usize {
        let Some(triggers) = &self.inner.triggers else {
            warn!("no observer platform configured, triggers not installed");
            return 0;
        };
        let sources = &self.inner.orchestrator.config().trigger_sources;
        triggers.install(sources, self.inner.handler.clone())
    }

    /// Runs one sync cycle now and returns its outcome.
    pub async fn sync_now(&self) -> SyncOutcome {
        self.inner.orchestrator.sync().await
    }

    /// Starts one sync cycle and reports whether it left nothing pending.
    ///
    /// Reports `false` at once if a cycle is already running.
    pub fn trigger_sync_now<F>(&self, on_complete: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.inner
            .orchestrator
            .trigger_sync(&self.inner.runtime, move |outcome| {
                on_complete(outcome.is_success())
            });
    }

    /// Sums a source over `[start, end)`.
    ///
    /// `None` if the source is not an aggregate source, has no adapter or
    /// cannot aggregate; `Some(0.0)` if the query failed.
    pub async fn get_aggregated_value_async(
        &self,
        source_id: &SourceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<f64> {
        if !self.inner.aggregate_sources.contains(source_id) {
            debug!(source = %source_id, "aggregate requested for unsupported source");
            return None;
        }
        let Some(adapter) = self.inner.registry.get(source_id) else {
            warn!(source = %source_id, "aggregate requested for unknown source");
            return None;
        };
        match adapter.aggregate(start, end).await {
            Ok(value) => value,
            Err(e) => {
                warn!(source = %source_id, error = %e, "aggregate query failed");
                Some(0.0)
            }
        }
    }

    /// Callback form of [`get_aggregated_value_async`](Self::get_aggregated_value_async).
    pub fn get_aggregated_value<F>(
        &self,
        source_id: SourceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        on_complete: F,
    ) where
        F: FnOnce(Option<f64>) + Send + 'static,
    {
        let this = self.clone();
        self.spawn(
            async move { this.get_aggregated_value_async(&source_id, start, end).await },
            on_complete,
        );
    }

    fn spawn<T, Fut, F>(&self, work: Fut, on_complete: F)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        self.inner.runtime.spawn(async move {
            on_complete(work.await);
        });
    }
}

impl std::fmt::Debug for HekaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HekaClient")
            .field("orchestrator", &self.inner.orchestrator)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Builder for [`HekaClient`].
pub struct HekaClientBuilder {
    config: SyncConfig,
    backend: Option<Arc<dyn KvBackend>>,
    registry: SourceRegistry,
    uploader: Option<Arc<dyn Uploader>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    platform: Option<Arc<dyn ObserverPlatform>>,
    runtime: Option<Handle>,
}

impl HekaClientBuilder {
    fn new(config: SyncConfig) -> Self {
        Self {
            config,
            backend: None,
            registry: SourceRegistry::new(),
            uploader: None,
            authorizer: None,
            platform: None,
            runtime: None,
        }
    }

    /// Sets the durable store backend. Required.
    pub fn backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Registers a source adapter.
    pub fn source(mut self, source_id: impl Into<SourceId>, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.registry.register(source_id, adapter);
        self
    }

    /// Replaces the source registry.
    pub fn sources(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the uploader. Required.
    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Sets the authorizer. Defaults to granting every request.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Sets the observer platform used by [`HekaClient::install_triggers`].
    pub fn observer_platform(mut self, platform: Arc<dyn ObserverPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Sets the runtime callbacks run on. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the client.
    pub fn build(self) -> SyncResult<HekaClient> {
        let backend = self
            .backend
            .ok_or_else(|| SyncError::Config("a store backend is required".into()))?;
        let uploader = self
            .uploader
            .ok_or_else(|| SyncError::Config("an uploader is required".into()))?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|_| SyncError::Config("no tokio runtime available".into()))?,
        };

        let store = Arc::new(CheckpointStore::new(backend, &self.config.namespace));
        let aggregate_sources = self.config.aggregate_sources.iter().cloned().collect();
        let registry = Arc::new(self.registry);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            self.config,
            store.clone(),
            registry.clone(),
            uploader,
        )?);
        let handler = Arc::new(TriggerHandler::new(orchestrator.clone(), runtime.clone()));

        Ok(HekaClient {
            inner: Arc::new(ClientInner {
                registry,
                aggregate_sources,
                store,
                orchestrator,
                authorizer: self
                    .authorizer
                    .unwrap_or_else(|| Arc::new(StaticAuthorizer::granting()) as Arc<dyn Authorizer>),
                triggers: self.platform.map(TriggerHub::new),
                handler,
                runtime,
            }),
        })
    }
}

/// An authorizer with a fixed answer, for headless hosts and tests.
pub struct StaticAuthorizer {
    granted: AtomicBool,
    requests: Mutex<Vec<Vec<SourceId>>>,
}

impl StaticAuthorizer {
    /// Grants every request.
    pub fn granting() -> Self {
        Self {
            granted: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Denies every request.
    pub fn denying() -> Self {
        let authorizer = Self::granting();
        authorizer.granted.store(false, Ordering::SeqCst);
        authorizer
    }

    /// Source lists requested so far.
    pub fn requests(&self) -> Vec<Vec<SourceId>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn request_authorization(&self, sources: &[SourceId]) -> SyncResult<bool> {
        self.requests.lock().push(sources.to_vec());
        Ok(self.granted.load(Ordering::SeqCst))
    }
}
