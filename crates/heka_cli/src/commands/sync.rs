//! Sync command implementation.
//!
//! Each source is a JSON file holding an array of records, oldest first. The
//! file is treated as an append-only log: the checkpoint is the number of
//! records already delivered, so appending to the file and syncing again
//! uploads only the new tail.

use super::CliError;
use crate::http::ReqwestClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heka_sync_engine::{
    encode_batch, Checkpoint, CheckpointStore, Collector, FetchResult, FetchWindow,
    HttpUploader, HttpUploaderConfig, Record, RecordValue, RetryConfig, SourceAdapter, SourceId,
    SourceRegistry, SyncConfig, SyncError, SyncOrchestrator, SyncOutcome, SyncResult,
    MAX_LOOKBACK,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Per-request timeout of the HTTP client.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Options of one `heka sync` run.
#[derive(Debug)]
pub struct SyncOptions {
    /// Sources and their record files.
    pub sources: Vec<(SourceId, PathBuf)>,
    /// Collector base URL; required unless dry-running.
    pub endpoint: Option<String>,
    /// Upload attempts.
    pub attempts: u32,
    /// Lookback for sources without a checkpoint.
    pub lookback: Duration,
    /// Store namespace.
    pub namespace: String,
    /// Print the batch instead of uploading it.
    pub dry_run: bool,
}

/// Parses a `<source>=<path>` argument.
pub fn parse_source_arg(value: &str) -> Result<(SourceId, PathBuf), String> {
    let (source, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected <source>=<path>, got {value:?}"))?;
    if source.is_empty() || path.is_empty() {
        return Err(format!("expected <source>=<path>, got {value:?}"));
    }
    Ok((SourceId::from(source), PathBuf::from(path)))
}

/// Converts `--lookback-days` into a duration.
pub fn lookback_from_days(days: u64) -> Result<Duration, CliError> {
    days.checked_mul(24 * 60 * 60)
        .map(Duration::from_secs)
        .filter(|lookback| !lookback.is_zero() && *lookback <= MAX_LOOKBACK)
        .ok_or_else(|| {
            CliError::InvalidArgument(format!(
                "--lookback-days must be between 1 and {}",
                MAX_LOOKBACK.as_secs() / (24 * 60 * 60)
            ))
        })
}

/// A source reading records from a JSON file.
pub struct JsonFileSource {
    source_id: SourceId,
    path: PathBuf,
}

impl JsonFileSource {
    /// Creates a source for `path`.
    pub fn new(source_id: SourceId, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id,
            path: path.into(),
        }
    }

    async fn load(&self) -> SyncResult<Vec<Record>> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            SyncError::source_fetch(self.source_id.as_str(), format!("{}: {e}", self.path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::source_fetch(self.source_id.as_str(), format!("{}: {e}", self.path.display()))
        })
    }
}

fn position_checkpoint(position: usize) -> Checkpoint {
    Checkpoint::from_bytes((position as u64).to_be_bytes().to_vec())
}

fn checkpoint_position(checkpoint: &Checkpoint) -> Option<usize> {
    let bytes: [u8; 8] = checkpoint.as_bytes().try_into().ok()?;
    usize::try_from(u64::from_be_bytes(bytes)).ok()
}

#[async_trait]
impl SourceAdapter for JsonFileSource {
    async fn fetch(
        &self,
        checkpoint: Option<Checkpoint>,
        window: FetchWindow,
    ) -> SyncResult<FetchResult> {
        let records = self.load().await?;
        let total = records.len();

        // A position past the end means the file was replaced; start over.
        let position = checkpoint
            .as_ref()
            .and_then(checkpoint_position)
            .filter(|p| *p <= total);
        let records: Vec<Record> = match position {
            Some(p) => records.into_iter().skip(p).collect(),
            None => records
                .into_iter()
                .filter(|r| r.interval_end >= window.start && r.interval_start <= window.end)
                .collect(),
        };
        debug!(source = %self.source_id, new = records.len(), total, "read record file");

        Ok(FetchResult {
            records,
            checkpoint: position_checkpoint(total),
        })
    }

    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SyncResult<Option<f64>> {
        let total = self
            .load()
            .await?
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

/// Runs one sync cycle, or prints the batch it would upload.
pub async fn run(
    store: Arc<CheckpointStore>,
    options: SyncOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let ids: Vec<SourceId> = options.sources.iter().map(|(id, _)| id.clone()).collect();
    let mut registry = SourceRegistry::new();
    for (source_id, path) in options.sources {
        let source = JsonFileSource::new(source_id.clone(), path);
        registry.register(source_id, Arc::new(source));
    }
    let registry = Arc::new(registry);

    let config = SyncConfig::new(ids)
        .with_lookback(options.lookback)
        .with_namespace(options.namespace)
        .with_upload_retry(RetryConfig::new(options.attempts));
    config.validate()?;

    if options.dry_run {
        return dry_run(store, registry, &config).await;
    }

    let endpoint = options
        .endpoint
        .ok_or_else(|| CliError::InvalidArgument("--endpoint is required unless --dry-run".into()))?;
    if !store.is_connected() {
        return Err(CliError::SyncFailed("not connected; run `heka connect` first".into()).into());
    }

    let uploader = HttpUploader::new(
        HttpUploaderConfig::new(endpoint),
        ReqwestClient::new(HTTP_TIMEOUT)?,
    );
    let orchestrator = SyncOrchestrator::new(config, store, registry, Arc::new(uploader))?;

    let outcome = orchestrator.sync().await;
    print_outcome(&outcome);
    if outcome.is_success() {
        Ok(())
    } else {
        let message = outcome
            .error()
            .map_or_else(|| "cycle did not run".to_string(), |e| e.to_string());
        Err(CliError::SyncFailed(message).into())
    }
}

async fn dry_run(
    store: Arc<CheckpointStore>,
    registry: Arc<SourceRegistry>,
    config: &SyncConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let collector = Collector::new(registry, store, config.lookback_delta()?, None);
    let collection = collector.collect_all(&config.sources, Utc::now()).await;

    for failure in &collection.failures {
        eprintln!("✗ {}: {}", failure.source_id, failure.message);
    }
    if collection.batch.is_empty() {
        println!("Nothing to upload");
        return Ok(());
    }

    let payload = encode_batch(&collection.batch)?;
    let json: serde_json::Value = serde_json::from_slice(&payload)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    info!(
        records = collection.batch.record_count(),
        bytes = payload.len(),
        "dry run, nothing uploaded or committed"
    );
    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Uploaded(report) => {
            println!("✓ Uploaded {} records", report.records_uploaded());
            for (source, count) in &report.records_per_source {
                println!("  {source:<28} {count}");
            }
            for failure in &report.failed_sources {
                println!("  ✗ {}: {}", failure.source_id, failure.message);
            }
            if !report.checkpoints_committed {
                println!("  ! checkpoints not stored; records will be sent again");
            }
        }
        SyncOutcome::NothingToUpload { failed_sources } => {
            println!("Nothing to upload");
            for failure in failed_sources {
                println!("  ✗ {}: {}", failure.source_id, failure.message);
            }
        }
        SyncOutcome::AlreadyRunning => println!("A sync is already running"),
        SyncOutcome::NotConnected => println!("Not connected"),
        SyncOutcome::Failed {
            error,
            failed_sources,
        } => {
            println!("✗ Sync failed: {error}");
            for failure in failed_sources {
                println!("  ✗ {}: {}", failure.source_id, failure.message);
            }
        }
    }
}
