//! Property-based test generators using proptest.
//!
//! Strategies produce records with finite values and well-ordered intervals,
//! so anything they generate is encodable.

use chrono::{DateTime, Duration, TimeZone, Utc};
use heka_sync_engine::{Batch, Checkpoint, Record, RecordValue, SourceId, UploadBehavior};
use proptest::prelude::*;

/// Strategy for source ids. Lower-case, so wire keys never collide.
pub fn source_id_strategy() -> impl Strategy<Value = SourceId> {
    prop::string::string_regex("[a-z][a-z_]{0,23}")
        .expect("Invalid regex")
        .prop_map(SourceId::from)
}

/// Strategy for opaque checkpoint tokens.
pub fn checkpoint_strategy() -> impl Strategy<Value = Checkpoint> {
    prop::collection::vec(any::<u8>(), 0..64).prop_map(Checkpoint::from_bytes)
}

/// Strategy for instants within 2020..2030.
pub fn instant_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (1_577_836_800i64..1_893_456_000i64).prop_map(|secs| {
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or_else(Utc::now)
    })
}

/// Strategy for record values.
pub fn record_value_strategy() -> impl Strategy<Value = RecordValue> {
    prop_oneof![
        4 => (0.0f64..1.0e6).prop_map(|value| RecordValue::Quantity { value }),
        1 => (0i64..8).prop_map(|value| RecordValue::Category { value }),
        1 => (
            prop::option::of(prop::string::string_regex("[A-Z_]{1,16}").expect("Invalid regex")),
            prop::option::of(0.0f64..5_000.0),
            prop::option::of(0.0f64..100_000.0),
        )
            .prop_map(|(activity_type, kcal, meters)| RecordValue::Workout {
                activity_type,
                total_energy_burned_kcal: kcal,
                total_distance_m: meters,
            }),
    ]
}

/// Strategy for a single record.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    (
        prop::string::string_regex("[0-9a-f]{8}-[0-9a-f]{4}").expect("Invalid regex"),
        record_value_strategy(),
        instant_strategy(),
        0i64..86_400,
    )
        .prop_map(|(id, value, start, secs)| Record {
            id,
            value,
            interval_start: start,
            interval_end: start + Duration::seconds(secs),
            source_bundle_id: "com.heka.generated".to_string(),
            source_name: "Generated".to_string(),
        })
}

/// Strategy for batches of up to `max_sources` sources.
pub fn batch_strategy(max_sources: usize) -> impl Strategy<Value = Batch> {
    prop::collection::btree_map(
        source_id_strategy(),
        prop::collection::vec(record_strategy(), 0..16),
        0..=max_sources,
    )
    .prop_map(|sources| {
        let mut batch = Batch::new();
        for (source_id, records) in sources {
            batch.insert(source_id, records);
        }
        batch
    })
}

/// Strategy for a sequence of uploader answers.
pub fn upload_behavior_strategy() -> impl Strategy<Value = UploadBehavior> {
    prop_oneof![
        3 => Just(UploadBehavior::Accept),
        1 => Just(UploadBehavior::Reject),
        1 => any::<bool>().prop_map(|retryable| UploadBehavior::Fail { retryable }),
    ]
}

/// Proptest run sizes.
#[derive(Debug, Clone)]
pub struct PropConfig {
    /// Cases per property.
    pub cases: u32,
    /// Shrink iterations on failure.
    pub max_shrink_iters: u32,
}

impl PropConfig {
    /// Small run for unit tests.
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 200,
        }
    }

    /// Larger run.
    pub fn thorough() -> Self {
        Self {
            cases: 512,
            max_shrink_iters: 4096,
        }
    }

    /// Converts to a proptest config.
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{minute_records, TestEnv};
    use crate::stress::collect_ids;
    use heka_sync_engine::{
        encode_batch, FetchWindow, MockSource, PendingCheckpointSet, SourceAdapter, SyncOutcome,
    };
    use std::collections::BTreeSet;

    proptest! {
        #![proptest_config(PropConfig::quick().to_proptest_config())]

        #[test]
        fn generated_batches_encode(batch in batch_strategy(4)) {
            let payload = encode_batch(&batch).unwrap();
            let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
            let object = json.as_object().unwrap();
            prop_assert_eq!(object.len(), batch.iter().count());
            let encoded: usize = object
                .values()
                .map(|v| v.as_array().map_or(0, Vec::len))
                .sum();
            prop_assert_eq!(encoded, batch.record_count());
        }

        #[test]
        fn resuming_from_any_checkpoint_loses_nothing(
            records in prop::collection::vec(record_strategy(), 1..24),
            split in 0usize..24,
        ) {
            let split = split.min(records.len());
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let source = MockSource::with_records(records.clone());
            let window = FetchWindow {
                start: Utc.timestamp_opt(0, 0).single().unwrap(),
                end: Utc::now(),
            };

            let fetched = runtime
                .block_on(source.fetch(Some(MockSource::checkpoint_at(split)), window))
                .unwrap();
            prop_assert_eq!(fetched.records.as_slice(), &records[split..]);
            prop_assert_eq!(
                MockSource::position_of(&fetched.checkpoint),
                Some(records.len())
            );
        }

        #[test]
        fn checkpoints_advance_only_with_accepted_uploads(
            cycles in prop::collection::vec((upload_behavior_strategy(), 1usize..4, 0usize..4), 1..12),
            foreign in checkpoint_strategy().prop_filter("not a log position", |c| c.as_bytes().len() != 8),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let env = TestEnv::builder()
                .source("steps", Vec::new())
                .source("calories", Vec::new())
                .connected()
                .build();
            let ids = [SourceId::from("steps"), SourceId::from("calories")];

            // Anchors the mock cannot resume from; they must survive until an upload succeeds.
            let mut seeded = PendingCheckpointSet::new();
            for id in &ids {
                seeded.insert(id.clone(), foreign.clone());
            }
            env.store.commit_pending(&seeded).unwrap();

            let mut appended = BTreeSet::new();
            let mut accepted = BTreeSet::new();
            let last = (UploadBehavior::Accept, 1, 1);
            for (round, (behavior, steps, calories)) in
                cycles.into_iter().chain(std::iter::once(last)).enumerate()
            {
                for (id, n) in ids.iter().zip([steps, calories]) {
                    let records = minute_records(&format!("{id}-r{round}"), n, Utc::now());
                    appended.extend(records.iter().map(|r| r.id.clone()));
                    env.source(id.as_str()).extend(records);
                }
                env.uploader.push_behavior(behavior);
                let before = env.store_contents();

                let outcome = runtime.block_on(env.orchestrator.sync());

                if behavior == UploadBehavior::Accept {
                    let committed = matches!(
                        &outcome,
                        SyncOutcome::Uploaded(report) if report.checkpoints_committed
                    );
                    prop_assert!(committed, "round {} did not commit: {:?}", round, outcome);
                    let payload = env.uploader.last_payload_json().unwrap();
                    collect_ids(&payload, &mut accepted);
                    for id in &ids {
                        let source = env.source(id.as_str());
                        prop_assert_eq!(
                            env.store.get_checkpoint(id),
                            Some(MockSource::checkpoint_at(source.len()))
                        );
                    }
                } else {
                    prop_assert!(!outcome.is_success(), "round {} succeeded: {:?}", round, outcome);
                    prop_assert_eq!(env.store_contents(), before);
                }
            }

            prop_assert_eq!(accepted, appended);
        }
    }
}
