//! Core data types: sources, checkpoints, records, batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a data source (e.g. a step-count stream).
///
/// Defined by configuration, never by user data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Creates a source id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the key used for this source in the uploaded batch.
    pub fn wire_key(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque resumption token for one source.
///
/// Marks "everything up to here has been durably delivered". Only the source
/// adapter that produced it can interpret the bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Checkpoint(Vec<u8>);

impl Checkpoint {
    /// Wraps raw token bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the checkpoint, yielding its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checkpoint({} bytes)", self.0.len())
    }
}

/// The measured value of a [`Record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordValue {
    /// A numeric quantity in the source's canonical unit.
    Quantity {
        /// Measured amount.
        value: f64,
    },
    /// An enumerated category code.
    Category {
        /// Category code.
        value: i64,
    },
    /// A workout summary.
    Workout {
        /// Activity name (e.g. "RUNNING").
        activity_type: Option<String>,
        /// Total energy burned in kilocalories.
        total_energy_burned_kcal: Option<f64>,
        /// Total distance in meters.
        total_distance_m: Option<f64>,
    },
}

/// A single observation produced by a source adapter. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique id of the observation (stable across re-fetches).
    pub id: String,
    /// Observed value.
    #[serde(flatten)]
    pub value: RecordValue,
    /// Start of the observed interval.
    pub interval_start: DateTime<Utc>,
    /// End of the observed interval.
    pub interval_end: DateTime<Utc>,
    /// Identifier of the app or device that produced the observation.
    pub source_bundle_id: String,
    /// Display name of the producing app or device.
    pub source_name: String,
}

impl Record {
    /// Creates a quantity record.
    pub fn quantity(
        id: impl Into<String>,
        value: f64,
        interval_start: DateTime<Utc>,
        interval_end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            value: RecordValue::Quantity { value },
            interval_start,
            interval_end,
            source_bundle_id: String::new(),
            source_name: String::new(),
        }
    }

    /// Sets the producing app or device.
    pub fn with_origin(mut self, bundle_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.source_bundle_id = bundle_id.into();
        self.source_name = name.into();
        self
    }
}

/// Records collected in one cycle, keyed by source.
///
/// Built fresh per cycle and discarded after the upload attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    entries: BTreeMap<SourceId, Vec<Record>>,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the records of one source. Empty record lists are ignored.
    pub fn insert(&mut self, source_id: SourceId, records: Vec<Record>) {
        if !records.is_empty() {
            self.entries.entry(source_id).or_default().extend(records);
        }
    }

    /// Returns true if the batch holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    /// Total number of records across all sources.
    pub fn record_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Records of one source.
    pub fn get(&self, source_id: &SourceId) -> Option<&[Record]> {
        self.entries.get(source_id).map(Vec::as_slice)
    }

    /// Iterates sources and their records in source order.
    pub fn iter(&self) -> impl Iterator<Item = (&SourceId, &[Record])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Number of records per source.
    pub fn counts(&self) -> BTreeMap<SourceId, usize> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }
}

/// New checkpoints gathered during one collector run, not yet committed.
///
/// Lives only in memory and only for one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingCheckpointSet {
    entries: BTreeMap<SourceId, Checkpoint>,
}

impl PendingCheckpointSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the new checkpoint of a source.
    pub fn insert(&mut self, source_id: SourceId, checkpoint: Checkpoint) {
        self.entries.insert(source_id, checkpoint);
    }

    /// Pending checkpoint of one source.
    pub fn get(&self, source_id: &SourceId) -> Option<&Checkpoint> {
        self.entries.get(source_id)
    }

    /// Number of pending checkpoints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates pending checkpoints in source order.
    pub fn iter(&self) -> impl Iterator<Item = (&SourceId, &Checkpoint)> {
        self.entries.iter()
    }
}

/// Time bounds passed to a source adapter alongside its checkpoint.
///
/// This is a heuristic bound; the checkpoint is authoritative when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// End (the cycle's `as_of` instant).
    pub end: DateTime<Utc>,
}

/// Credentials sent with every upload.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Collector API key.
    pub api_key: String,
    /// User identifier at the collector.
    pub user_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Whether syncing is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Connected; triggers start sync cycles.
    Connected,
    /// Disconnected; triggers are acknowledged and ignored.
    #[default]
    Disconnected,
}

/// Connection state as persisted by the checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    /// Connected or not.
    pub status: ConnectionStatus,
    /// Stored API key (empty when disconnected).
    pub api_key: String,
    /// Stored user id (empty when disconnected).
    pub user_id: String,
    /// Instant of the first confirmed upload (or the host-provided last sync date).
    pub first_upload: Option<DateTime<Utc>>,
}

impl ConnectionState {
    /// Returns true if connected.
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Returns upload credentials if connected.
    pub fn credentials(&self) -> Option<Credentials> {
        if self.is_connected() {
            Some(Credentials {
                api_key: self.api_key.clone(),
                user_id: self.user_id.clone(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn wire_key_is_lowercase() {
        assert_eq!(SourceId::new("HKQuantityTypeIdentifierStepCount").wire_key(), "hkquantitytypeidentifierstepcount");
        assert_eq!(SourceId::from("steps").to_string(), "steps");
    }

    #[test]
    fn batch_skips_empty_sources() {
        let mut batch = Batch::new();
        batch.insert("steps".into(), vec![]);
        assert!(batch.is_empty());
        assert!(batch.get(&"steps".into()).is_none());

        batch.insert("steps".into(), vec![Record::quantity("a", 1.0, at(0), at(60))]);
        batch.insert("steps".into(), vec![Record::quantity("b", 2.0, at(60), at(120))]);
        assert!(!batch.is_empty());
        assert_eq!(batch.record_count(), 2);
        assert_eq!(batch.counts().get(&SourceId::from("steps")), Some(&2));
    }

    #[test]
    fn pending_set_overwrites() {
        let mut pending = PendingCheckpointSet::new();
        pending.insert("steps".into(), Checkpoint::from_bytes(vec![1]));
        pending.insert("steps".into(), Checkpoint::from_bytes(vec![2]));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.get(&"steps".into()).unwrap().as_bytes(), &[2]);
    }

    #[test]
    fn credentials_only_when_connected() {
        let mut state = ConnectionState {
            status: ConnectionStatus::Disconnected,
            api_key: "key".into(),
            user_id: "user".into(),
            first_upload: None,
        };
        assert!(state.credentials().is_none());

        state.status = ConnectionStatus::Connected;
        let creds = state.credentials().unwrap();
        assert_eq!(creds.user_id, "user");
        assert!(!format!("{creds:?}").contains("key\""));
    }

    #[test]
    fn record_serde_uses_kind_tag() {
        let record = Record::quantity("id-1", 12.5, at(0), at(60)).with_origin("com.example", "Watch");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "quantity");
        assert_eq!(json["value"], 12.5);

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
