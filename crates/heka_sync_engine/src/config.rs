//! Configuration for the sync engine.

use crate::catalog;
use crate::error::{SyncError, SyncResult};
use crate::types::SourceId;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Default lookback when no first-upload date is known.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Longest accepted lookback.
pub const MAX_LOOKBACK: Duration = Duration::from_secs(3660 * 24 * 60 * 60);

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Sources fetched by every cycle.
    pub sources: Vec<SourceId>,
    /// Sources whose change notifications trigger a cycle.
    pub trigger_sources: Vec<SourceId>,
    /// How far back to look when a source has no checkpoint.
    pub lookback: Duration,
    /// Upper bound on a single source fetch.
    pub fetch_timeout: Option<Duration>,
    /// Directory for transient serialized batches. `None` keeps them in memory.
    pub spool_dir: Option<PathBuf>,
    /// Prefix for all store keys (usually the host app's bundle id).
    pub namespace: String,
    /// In-cycle retry for retryable upload failures.
    pub upload_retry: RetryConfig,
    /// Sources the aggregation API answers for.
    pub aggregate_sources: Vec<SourceId>,
}

impl SyncConfig {
    /// Creates a configuration syncing the given sources.
    pub fn new(sources: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            trigger_sources: catalog::default_trigger_sources(),
            lookback: DEFAULT_LOOKBACK,
            fetch_timeout: None,
            spool_dir: None,
            namespace: String::new(),
            upload_retry: RetryConfig::no_retry(),
            aggregate_sources: catalog::aggregate_sources(),
        }
    }

    /// Sets the trigger sources.
    pub fn with_trigger_sources(mut self, sources: impl IntoIterator<Item = SourceId>) -> Self {
        self.trigger_sources = sources.into_iter().collect();
        self
    }

    /// Sets the lookback length.
    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    /// Sets the per-source fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Spools serialized batches under `dir`.
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    /// Sets the store key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the upload retry configuration.
    pub fn with_upload_retry(mut self, retry: RetryConfig) -> Self {
        self.upload_retry = retry;
        self
    }

    /// Sets the sources the aggregation API answers for.
    pub fn with_aggregate_sources(mut self, sources: impl IntoIterator<Item = SourceId>) -> Self {
        self.aggregate_sources = sources.into_iter().collect();
        self
    }

    /// Checks the configuration for obvious mistakes.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sources.is_empty() {
            return Err(SyncError::Config("no sources configured".into()));
        }
        if self.lookback.is_zero() {
            return Err(SyncError::Config("lookback must be positive".into()));
        }
        if self.lookback > MAX_LOOKBACK {
            return Err(SyncError::Config(format!(
                "lookback of {}s exceeds the maximum of {}s",
                self.lookback.as_secs(),
                MAX_LOOKBACK.as_secs()
            )));
        }
        if self.upload_retry.max_attempts == 0 {
            return Err(SyncError::Config(
                "upload_retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.fetch_timeout.is_some_and(|t| t.is_zero()) {
            return Err(SyncError::Config("fetch timeout must be positive".into()));
        }
        Ok(())
    }

    /// Lookback as a calendar duration.
    pub fn lookback_delta(&self) -> SyncResult<chrono::Duration> {
        chrono::Duration::from_std(self.lookback)
            .map_err(|_| SyncError::Config("lookback out of range".into()))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(catalog::default_sync_sources())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% extra
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
