//! Concurrent fan-out over sources, fan-in into one batch.

use crate::checkpoint::CheckpointStore;
use crate::error::SyncError;
use crate::source::{FetchResult, SourceRegistry};
use crate::types::{Batch, FetchWindow, PendingCheckpointSet, SourceId};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A source that contributed nothing to a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    /// Failing source.
    pub source_id: SourceId,
    /// Why it failed.
    pub message: String,
}

/// Output of one collector run.
#[derive(Debug, Default)]
pub struct Collection {
    /// Records of all sources that returned any.
    pub batch: Batch,
    /// New checkpoints of every source that fetched successfully.
    pub pending: PendingCheckpointSet,
    /// Sources that failed.
    pub failures: Vec<SourceFailure>,
}

/// Fetches all configured sources in parallel.
#[derive(Debug, Clone)]
pub struct Collector {
    registry: Arc<SourceRegistry>,
    store: Arc<CheckpointStore>,
    lookback: chrono::Duration,
    fetch_timeout: Option<Duration>,
}

impl Collector {
    /// Creates a collector.
    pub fn new(
        registry: Arc<SourceRegistry>,
        store: Arc<CheckpointStore>,
        lookback: chrono::Duration,
        fetch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            store,
            lookback,
            fetch_timeout,
        }
    }

    /// Window for a cycle at `as_of`.
    ///
    /// Starts `lookback` before `as_of`, or at `first_upload` if that is later.
    /// A lookback reaching past the earliest representable instant starts there.
    pub fn lookback_window(
        &self,
        as_of: DateTime<Utc>,
        first_upload: Option<DateTime<Utc>>,
    ) -> FetchWindow {
        let default_start = as_of
            .checked_sub_signed(self.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let start = match first_upload {
            Some(first) if first > default_start => first,
            _ => default_start,
        };
        FetchWindow { start, end: as_of }
    }

    /// Fetches every source in `sources` concurrently and waits for all.
    ///
    /// Never fails as a whole: each failing source is reported in
    /// [`Collection::failures`] and contributes neither records nor a checkpoint.
    pub async fn collect_all(&self, sources: &[SourceId], as_of: DateTime<Utc>) -> Collection {
        let window = self.lookback_window(as_of, self.store.last_sync_date());
        let unique: BTreeSet<&SourceId> = sources.iter().collect();

        let mut collection = Collection::default();
        let mut tasks = JoinSet::new();
        let mut outstanding = BTreeSet::new();

        for source_id in unique {
            let Some(adapter) = self.registry.get(source_id) else {
                warn!(source = %source_id, "no adapter registered");
                collection.failures.push(SourceFailure {
                    source_id: source_id.clone(),
                    message: SyncError::UnknownSource(source_id.to_string()).to_string(),
                });
                continue;
            };
            let checkpoint = self.store.get_checkpoint(source_id);
            debug!(
                source = %source_id,
                resumed = checkpoint.is_some(),
                start = %window.start,
                "fetching"
            );

            let id = source_id.clone();
            let timeout = self.fetch_timeout;
            outstanding.insert(id.clone());
            tasks.spawn(async move {
                let fetch = AssertUnwindSafe(adapter.fetch(checkpoint, window)).catch_unwind();
                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, fetch).await {
                        Ok(result) => result,
                        Err(_) => Ok(Err(SyncError::Timeout)),
                    },
                    None => fetch.await,
                };
                let result = result.unwrap_or_else(|_| {
                    Err(SyncError::Internal("source adapter panicked".into()))
                });
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source_id, result)) => {
                    outstanding.remove(&source_id);
                    collection.absorb(source_id, result);
                }
                Err(e) => warn!(error = %e, "fetch task did not complete"),
            }
        }
        // Only reachable if a task was cancelled.
        for source_id in outstanding {
            collection.failures.push(SourceFailure {
                source_id,
                message: "fetch task cancelled".into(),
            });
        }

        info!(
            records = collection.batch.record_count(),
            sources = collection.pending.len(),
            failed = collection.failures.len(),
            "collection finished"
        );
        collection
    }
}

impl Collection {
    fn absorb(&mut self, source_id: SourceId, result: Result<FetchResult, SyncError>) {
        match result {
            Ok(FetchResult {
                records,
                checkpoint,
            }) => {
                debug!(source = %source_id, records = records.len(), "fetched");
                self.batch.insert(source_id.clone(), records);
                self.pending.insert(source_id, checkpoint);
            }
            Err(e) => {
                warn!(source = %source_id, error = %e, "source fetch failed");
                self.failures.push(SourceFailure {
                    source_id,
                    message: e.to_string(),
                });
            }
        }
    }

    /// Returns true if `source_id` failed this run.
    pub fn failed(&self, source_id: &SourceId) -> bool {
        self.failures.iter().any(|f| &f.source_id == source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;
    use crate::types::{Checkpoint, Record};
    use chrono::TimeZone;
    use heka_storage::InMemoryBackend;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn collector(
        sources: Vec<(&str, Arc<MockSource>)>,
        timeout: Option<Duration>,
    ) -> (Collector, Arc<CheckpointStore>) {
        let store = Arc::new(CheckpointStore::new(Arc::new(InMemoryBackend::new()), ""));
        let mut registry = SourceRegistry::new();
        for (id, source) in sources {
            registry.register(id, source);
        }
        let collector = Collector::new(
            Arc::new(registry),
            store.clone(),
            chrono::Duration::days(7),
            timeout,
        );
        (collector, store)
    }

    #[test]
    fn window_defaults_to_lookback() {
        let (collector, _) = collector(vec![], None);
        let as_of = at(0);
        let window = collector.lookback_window(as_of, None);
        assert_eq!(window.start, as_of - chrono::Duration::days(7));
        assert_eq!(window.end, as_of);
    }

    #[test]
    fn window_uses_later_first_upload() {
        let (collector, _) = collector(vec![], None);
        let as_of = at(0);

        let recent = as_of - chrono::Duration::days(2);
        assert_eq!(collector.lookback_window(as_of, Some(recent)).start, recent);

        let ancient = as_of - chrono::Duration::days(30);
        assert_eq!(
            collector.lookback_window(as_of, Some(ancient)).start,
            as_of - chrono::Duration::days(7)
        );
    }

    #[test]
    fn window_clamps_lookback_past_earliest_instant() {
        let store = Arc::new(CheckpointStore::new(Arc::new(InMemoryBackend::new()), ""));
        let collector = Collector::new(
            Arc::new(SourceRegistry::new()),
            store,
            chrono::Duration::days(100_000_000),
            None,
        );
        let as_of = at(0);
        let window = collector.lookback_window(as_of, None);
        assert_eq!(window.start, DateTime::<Utc>::MIN_UTC);
        assert_eq!(window.end, as_of);
    }

    #[tokio::test]
    async fn collects_all_sources() {
        let steps = Arc::new(MockSource::with_records(vec![
            Record::quantity("s1", 10.0, at(-60), at(-30)),
            Record::quantity("s2", 12.0, at(-30), at(-1)),
        ]));
        let sleep = Arc::new(MockSource::new());
        let (collector, _) = collector(vec![("steps", steps), ("sleep", sleep)], None);

        let sources = vec![SourceId::from("steps"), SourceId::from("sleep")];
        let collection = collector.collect_all(&sources, at(0)).await;

        assert_eq!(collection.batch.record_count(), 2);
        // Sources with no records are absent from the batch but still checkpointed.
        assert!(collection.batch.get(&"sleep".into()).is_none());
        assert_eq!(collection.pending.len(), 2);
        assert_eq!(
            collection.pending.get(&"sleep".into()),
            Some(&MockSource::checkpoint_at(0))
        );
        assert!(collection.failures.is_empty());
    }

    #[tokio::test]
    async fn failing_source_is_isolated() {
        let steps = Arc::new(MockSource::with_records(vec![Record::quantity(
            "s1",
            10.0,
            at(-60),
            at(-30),
        )]));
        let broken = Arc::new(MockSource::new());
        broken.set_failing(true);
        let (collector, _) = collector(vec![("steps", steps), ("broken", broken)], None);

        let sources = vec![
            SourceId::from("steps"),
            SourceId::from("broken"),
            SourceId::from("unregistered"),
        ];
        let collection = collector.collect_all(&sources, at(0)).await;

        assert_eq!(collection.batch.record_count(), 1);
        assert_eq!(collection.pending.len(), 1);
        assert!(collection.pending.get(&"broken".into()).is_none());
        assert!(collection.failed(&"broken".into()));
        assert!(collection.failed(&"unregistered".into()));
        assert_eq!(collection.failures.len(), 2);
    }

    #[tokio::test]
    async fn panicking_source_becomes_failure() {
        let steps = Arc::new(MockSource::new());
        steps.panic_next();
        let other = Arc::new(MockSource::with_records(vec![Record::quantity(
            "o1",
            1.0,
            at(-10),
            at(-5),
        )]));
        let (collector, _) = collector(vec![("steps", steps), ("other", other)], None);

        let sources = vec![SourceId::from("steps"), SourceId::from("other")];
        let collection = collector.collect_all(&sources, at(0)).await;

        assert!(collection.failed(&"steps".into()));
        assert_eq!(collection.batch.record_count(), 1);
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let slow = Arc::new(MockSource::new());
        slow.set_delay(Duration::from_secs(30));
        let (collector, _) = collector(vec![("slow", slow)], Some(Duration::from_millis(50)));

        let collection = collector.collect_all(&[SourceId::from("slow")], at(0)).await;
        assert!(collection.failed(&"slow".into()));
        assert!(collection.pending.is_empty());
    }

    #[tokio::test]
    async fn stored_checkpoint_is_passed_to_adapter() {
        let steps = Arc::new(MockSource::with_records(vec![
            Record::quantity("s1", 10.0, at(-60), at(-30)),
            Record::quantity("s2", 12.0, at(-30), at(-1)),
        ]));
        let (collector, store) = collector(vec![("steps", steps.clone())], None);
        let mut pending = PendingCheckpointSet::new();
        pending.insert("steps".into(), MockSource::checkpoint_at(1));
        store.commit_pending(&pending).unwrap();

        let collection = collector.collect_all(&[SourceId::from("steps")], at(0)).await;
        assert_eq!(collection.batch.record_count(), 1);
        assert_eq!(
            steps.calls()[0].checkpoint,
            Some(Checkpoint::from_bytes(1u64.to_be_bytes().to_vec()))
        );
    }

    #[tokio::test]
    async fn duplicate_ids_fetch_once() {
        let steps = Arc::new(MockSource::new());
        let (collector, _) = collector(vec![("steps", steps.clone())], None);
        let sources = vec![SourceId::from("steps"), SourceId::from("steps")];
        collector.collect_all(&sources, at(0)).await;
        assert_eq!(steps.fetch_count(), 1);
    }
}
