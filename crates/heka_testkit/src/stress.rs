//! Stress helpers for the sync orchestrator.
//!
//! These drive many overlapping sync requests and check that single-flight
//! and commit-on-success hold under load.

use crate::fixtures::{minute_records, TestEnv};
use chrono::Utc;
use heka_sync_engine::{SyncOutcome, UploadBehavior};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

/// Result of a stress run.
#[derive(Debug, Clone, Default)]
pub struct StressTestResult {
    /// Requests issued.
    pub requests: usize,
    /// Cycles that uploaded a batch.
    pub uploaded: usize,
    /// Cycles that found nothing new.
    pub empty: usize,
    /// Requests dropped because a cycle was running.
    pub already_running: usize,
    /// Cycles that failed.
    pub failed: usize,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl StressTestResult {
    fn record(&mut self, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Uploaded(_) => self.uploaded += 1,
            SyncOutcome::NothingToUpload { .. } => self.empty += 1,
            SyncOutcome::AlreadyRunning => self.already_running += 1,
            SyncOutcome::NotConnected | SyncOutcome::Failed { .. } => self.failed += 1,
        }
    }

    /// Outcomes reported, one per request.
    pub fn reported(&self) -> usize {
        self.uploaded + self.empty + self.already_running + self.failed
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Requests: {}", self.requests);
        println!("Uploaded: {}", self.uploaded);
        println!("Empty: {}", self.empty);
        println!("Already running: {}", self.already_running);
        println!("Failed: {}", self.failed);
        println!("Duration: {:?}", self.duration);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Sync requests to issue.
    pub requests: usize,
    /// Records appended to each source between rounds.
    pub records_per_round: usize,
    /// Rounds for [`ingest_rounds`].
    pub rounds: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            requests: 64,
            records_per_round: 5,
            rounds: 20,
        }
    }
}

/// Issues `config.requests` fire-and-forget triggers at once and waits for
/// every completion callback.
pub async fn trigger_storm(env: &TestEnv, config: &StressConfig) -> StressTestResult {
    let started = Instant::now();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let runtime = Handle::current();

    for _ in 0..config.requests {
        let tx = tx.clone();
        env.orchestrator.trigger_sync(&runtime, move |outcome| {
            let _ = tx.send(outcome);
        });
    }
    drop(tx);

    let mut result = StressTestResult {
        requests: config.requests,
        ..StressTestResult::default()
    };
    while let Some(outcome) = rx.recv().await {
        result.record(&outcome);
    }
    result.duration = started.elapsed();
    result
}

/// Appends records to every source and syncs, `config.rounds` times, with
/// the uploader failing every other attempt starting with the first.
///
/// Returns the run result and the ids of every record the uploader accepted.
pub async fn ingest_rounds(
    env: &TestEnv,
    config: &StressConfig,
) -> (StressTestResult, BTreeSet<String>) {
    let started = Instant::now();
    let mut result = StressTestResult::default();
    let mut accepted = BTreeSet::new();

    for round in 0..config.rounds {
        for (source_id, source) in &env.sources {
            let prefix = format!("{source_id}-r{round}");
            source.extend(minute_records(&prefix, config.records_per_round, Utc::now()));
        }
        if round % 2 == 0 {
            env.uploader.push_behavior(UploadBehavior::Fail { retryable: false });
        }

        let outcome = env.orchestrator.sync().await;
        result.requests += 1;
        result.record(&outcome);
        if matches!(outcome, SyncOutcome::Uploaded(_)) {
            if let Some(payload) = env.uploader.last_payload_json() {
                collect_ids(&payload, &mut accepted);
            }
        }
    }

    result.duration = started.elapsed();
    (result, accepted)
}

pub(crate) fn collect_ids(payload: &serde_json::Value, into: &mut BTreeSet<String>) {
    let Some(sources) = payload.as_object() else {
        return;
    };
    for records in sources.values().filter_map(|v| v.as_array()) {
        for id in records.iter().filter_map(|r| r.get("uuid")?.as_str()) {
            into.insert(id.to_string());
        }
    }
}

/// Shares one environment across tasks issuing awaited syncs concurrently.
pub async fn concurrent_syncs(env: Arc<TestEnv>, tasks: usize) -> StressTestResult {
    let started = Instant::now();
    let mut set = tokio::task::JoinSet::new();
    for _ in 0..tasks {
        let env = Arc::clone(&env);
        set.spawn(async move { env.orchestrator.sync().await });
    }

    let mut result = StressTestResult {
        requests: tasks,
        ..StressTestResult::default()
    };
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => result.record(&outcome),
            Err(_) => result.failed += 1,
        }
    }
    result.duration = started.elapsed();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::scenarios;
    use heka_sync_engine::{MockUploader, SyncState};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn storm_reports_every_request_once() {
        let env = TestEnv::builder()
            .source("steps", minute_records("steps", 10, Utc::now()))
            .connected()
            .uploader(MockUploader::paused())
            .build();
        let config = StressConfig {
            requests: 32,
            ..StressConfig::default()
        };

        let uploader = env.uploader.clone();
        let release = tokio::spawn(async move {
            uploader.wait_started().await;
            uploader.release(1);
        });
        let result = trigger_storm(&env, &config).await;
        release.await.unwrap();

        assert_eq!(result.reported(), 32);
        assert_eq!(result.uploaded, 1);
        assert_eq!(result.already_running, 31);
        assert_eq!(env.uploader.attempts(), 1);
        assert_eq!(env.orchestrator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn failed_rounds_are_redelivered() {
        let env = scenarios::steps_and_calories(0);
        let config = StressConfig {
            rounds: 6,
            records_per_round: 3,
            ..StressConfig::default()
        };

        let (result, accepted) = ingest_rounds(&env, &config).await;

        assert_eq!(result.uploaded, 3);
        assert_eq!(result.failed, 3);
        // Every record from every round was eventually accepted.
        assert_eq!(accepted.len(), 2 * 6 * 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_syncs_never_overlap() {
        let env = Arc::new(
            TestEnv::builder()
                .source("steps", minute_records("steps", 4, Utc::now()))
                .connected()
                .build(),
        );

        let result = concurrent_syncs(env.clone(), 16).await;

        assert_eq!(result.reported(), 16);
        assert_eq!(result.failed, 0);
        assert_eq!(result.uploaded + result.empty + result.already_running, 16);
        assert!(result.uploaded >= 1);
        assert_eq!(env.uploader.attempts(), result.uploaded);
    }
}
