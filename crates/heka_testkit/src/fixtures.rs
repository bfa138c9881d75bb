//! Test fixtures.
//!
//! [`TestEnv`] wires a checkpoint store, mock sources, a mock uploader and an
//! orchestrator together so tests can drive whole sync cycles.

use chrono::{DateTime, Duration, TimeZone, Utc};
use heka_storage::{FileBackend, InMemoryBackend, KvBackend};
use heka_sync_engine::{
    CheckpointStore, MockSource, MockUploader, Record, SourceId, SourceRegistry, SyncConfig,
    SyncOrchestrator,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Fixed reference instant used by fixtures: 2024-01-15T12:00:00Z.
pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0)
        .single()
        .expect("valid reference time")
}

/// `n` one-minute quantity records ending before `end`, oldest first.
///
/// Ids are `<prefix>-0`, `<prefix>-1`, ...
pub fn minute_records(prefix: &str, n: usize, end: DateTime<Utc>) -> Vec<Record> {
    (0..n)
        .map(|i| {
            let start = end - Duration::minutes((n - i) as i64 + 1);
            Record::quantity(
                format!("{prefix}-{i}"),
                (i + 1) as f64 * 10.0,
                start,
                start + Duration::seconds(59),
            )
            .with_origin("com.heka.tests", "Test Device")
        })
        .collect()
}

/// A store backend kept alive together with its temp directory.
pub struct TestStore {
    /// The backend.
    pub backend: Arc<dyn KvBackend>,
    _temp_dir: Option<TempDir>,
    path: Option<PathBuf>,
}

impl TestStore {
    /// In-memory store.
    pub fn memory() -> Self {
        Self {
            backend: Arc::new(InMemoryBackend::new()),
            _temp_dir: None,
            path: None,
        }
    }

    /// File-backed store in a fresh temp directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("heka.store");
        let backend = FileBackend::open(&path).expect("Failed to open file backend");
        Self {
            backend: Arc::new(backend),
            _temp_dir: Some(temp_dir),
            path: Some(path),
        }
    }

    /// Snapshot path if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Checkpoint store over this backend.
    pub fn checkpoint_store(&self, namespace: &str) -> Arc<CheckpointStore> {
        Arc::new(CheckpointStore::new(self.backend.clone(), namespace))
    }
}

/// A complete sync setup over mock collaborators.
pub struct TestEnv {
    /// Store backend.
    pub store_backend: TestStore,
    /// Checkpoint store.
    pub store: Arc<CheckpointStore>,
    /// Mock sources by id.
    pub sources: BTreeMap<SourceId, Arc<MockSource>>,
    /// Mock uploader.
    pub uploader: Arc<MockUploader>,
    /// Orchestrator under test.
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl TestEnv {
    /// Starts building an environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::default()
    }

    /// Mock source registered under `id`.
    pub fn source(&self, id: &str) -> &Arc<MockSource> {
        self.sources
            .get(&SourceId::from(id))
            .unwrap_or_else(|| panic!("no source named {id}"))
    }

    /// Raw contents of the backend under this environment's keys.
    pub fn store_contents(&self) -> BTreeMap<String, Vec<u8>> {
        let backend = &self.store_backend.backend;
        backend
            .keys_with_prefix("")
            .expect("store readable")
            .into_iter()
            .filter_map(|key| {
                let value = backend.get(&key).expect("store readable")?;
                Some((key, value))
            })
            .collect()
    }
}

/// Builder for [`TestEnv`].
#[derive(Default)]
pub struct TestEnvBuilder {
    sources: Vec<(SourceId, Vec<Record>)>,
    file_backed: bool,
    connected: bool,
    uploader: Option<MockUploader>,
    configure: Option<Box<dyn FnOnce(SyncConfig) -> SyncConfig>>,
}

impl TestEnvBuilder {
    /// Adds a mock source holding `records`.
    pub fn source(mut self, id: &str, records: Vec<Record>) -> Self {
        self.sources.push((SourceId::from(id), records));
        self
    }

    /// Uses a file-backed store.
    pub fn file_backed(mut self) -> Self {
        self.file_backed = true;
        self
    }

    /// Stores credentials before the first cycle.
    pub fn connected(mut self) -> Self {
        self.connected = true;
        self
    }

    /// Uses `uploader` instead of an accepting one.
    pub fn uploader(mut self, uploader: MockUploader) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Adjusts the sync configuration.
    pub fn configure(mut self, f: impl FnOnce(SyncConfig) -> SyncConfig + 'static) -> Self {
        self.configure = Some(Box::new(f));
        self
    }

    /// Builds the environment.
    pub fn build(self) -> TestEnv {
        let store_backend = if self.file_backed {
            TestStore::file()
        } else {
            TestStore::memory()
        };

        let mut config = SyncConfig::new(self.sources.iter().map(|(id, _)| id.clone()));
        if let Some(configure) = self.configure {
            config = configure(config);
        }
        let store = store_backend.checkpoint_store(&config.namespace);
        if self.connected {
            store
                .mark_connected("test-api-key", "test-user", None)
                .expect("Failed to connect");
        }

        let mut registry = SourceRegistry::new();
        let mut sources = BTreeMap::new();
        for (id, records) in self.sources {
            let source = Arc::new(MockSource::with_records(records));
            registry.register(id.clone(), source.clone());
            sources.insert(id, source);
        }

        let uploader = Arc::new(self.uploader.unwrap_or_default());
        let orchestrator = Arc::new(
            SyncOrchestrator::new(config, store.clone(), Arc::new(registry), uploader.clone())
                .expect("Failed to build orchestrator"),
        );

        TestEnv {
            store_backend,
            store,
            sources,
            uploader,
            orchestrator,
        }
    }
}

/// Common scenarios.
pub mod scenarios {
    use super::*;

    /// Connected environment with `steps` and `calories`, `n` records each,
    /// all within the last hour.
    pub fn steps_and_calories(n: usize) -> TestEnv {
        let now = Utc::now();
        TestEnv::builder()
            .source("steps", minute_records("steps", n, now))
            .source("calories", minute_records("calories", n, now))
            .connected()
            .build()
    }
}
