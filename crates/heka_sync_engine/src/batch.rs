//! Batch wire format and transient spool files.
//!
//! The wire format is a JSON object keyed by lower-cased source id, each value
//! an array of records:
//!
//! ```json
//! {"steps": [{"uuid": "...", "value": 42.0, "date_from": 1700000000000,
//!             "date_to": 1700000060000, "source_id": "com.apple.health",
//!             "source_name": "iPhone"}]}
//! ```
//!
//! Workout records carry `workoutActivityType`, `totalEnergyBurned`,
//! `totalEnergyBurnedUnit`, `totalDistance` and `totalDistanceUnit` in place
//! of `value`.

use crate::error::{SyncError, SyncResult};
use crate::types::{Batch, Record, RecordValue};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SPOOL_PREFIX: &str = "heka_batch_";
const SPOOL_EXT: &str = "json";

#[derive(Serialize)]
struct WireRecord<'a> {
    uuid: &'a str,
    #[serde(flatten)]
    value: WireValue<'a>,
    date_from: i64,
    date_to: i64,
    source_id: &'a str,
    source_name: &'a str,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireValue<'a> {
    Quantity {
        value: f64,
    },
    Category {
        value: i64,
    },
    #[serde(rename_all = "camelCase")]
    Workout {
        workout_activity_type: Option<&'a str>,
        total_energy_burned: Option<f64>,
        total_energy_burned_unit: &'static str,
        total_distance: Option<f64>,
        total_distance_unit: &'static str,
    },
}

impl<'a> WireRecord<'a> {
    fn from_record(record: &'a Record) -> SyncResult<Self> {
        let value = match &record.value {
            RecordValue::Quantity { value } => WireValue::Quantity {
                value: finite(*value, record)?,
            },
            RecordValue::Category { value } => WireValue::Category { value: *value },
            RecordValue::Workout {
                activity_type,
                total_energy_burned_kcal,
                total_distance_m,
            } => WireValue::Workout {
                workout_activity_type: activity_type.as_deref(),
                total_energy_burned: total_energy_burned_kcal
                    .map(|v| finite(v, record))
                    .transpose()?,
                total_energy_burned_unit: "KILOCALORIE",
                total_distance: total_distance_m.map(|v| finite(v, record)).transpose()?,
                total_distance_unit: "METER",
            },
        };
        Ok(Self {
            uuid: &record.id,
            value,
            date_from: record.interval_start.timestamp_millis(),
            date_to: record.interval_end.timestamp_millis(),
            source_id: &record.source_bundle_id,
            source_name: &record.source_name,
        })
    }
}

// JSON has no representation for NaN or infinity.
fn finite(value: f64, record: &Record) -> SyncResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SyncError::Serialization(format!(
            "record {} has non-finite value {value}",
            record.id
        )))
    }
}

/// Serializes a batch into its wire form.
pub fn encode_batch(batch: &Batch) -> SyncResult<Vec<u8>> {
    let mut wire: BTreeMap<String, Vec<WireRecord<'_>>> = BTreeMap::new();
    for (source_id, records) in batch.iter() {
        let entry = wire.entry(source_id.wire_key()).or_default();
        for record in records {
            entry.push(WireRecord::from_record(record)?);
        }
    }
    serde_json::to_vec(&wire).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Directory holding serialized batches while they are being uploaded.
#[derive(Debug, Clone)]
pub struct BatchSpool {
    dir: PathBuf,
}

impl BatchSpool {
    /// Opens a spool directory, creating it and removing leftovers of
    /// interrupted cycles.
    pub fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(SyncError::Spool)?;
        let spool = Self { dir };
        let removed = spool.remove_stale()?;
        if removed > 0 {
            warn!(removed, dir = %spool.dir.display(), "removed stale spooled batches");
        }
        Ok(spool)
    }

    /// Spool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes a serialized batch to a fresh file.
    pub fn write(&self, payload: &[u8]) -> SyncResult<SpooledBatch> {
        let path = self.dir.join(format!(
            "{SPOOL_PREFIX}{}.{SPOOL_EXT}",
            uuid::Uuid::new_v4()
        ));
        let mut file = fs::File::create(&path).map_err(SyncError::Spool)?;
        // From here on the guard owns the file, even if the write fails.
        let spooled = SpooledBatch { path };
        file.write_all(payload).map_err(SyncError::Spool)?;
        file.sync_all().map_err(SyncError::Spool)?;
        debug!(path = %spooled.path.display(), bytes = payload.len(), "batch spooled");
        Ok(spooled)
    }

    /// Paths of spooled batches currently on disk.
    pub fn pending_files(&self) -> SyncResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(SyncError::Spool)? {
            let path = entry.map_err(SyncError::Spool)?.path();
            if is_spool_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn remove_stale(&self) -> SyncResult<usize> {
        let files = self.pending_files()?;
        for path in &files {
            fs::remove_file(path).map_err(SyncError::Spool)?;
        }
        Ok(files.len())
    }
}

fn is_spool_file(path: &Path) -> bool {
    let name_matches = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(SPOOL_PREFIX));
    name_matches && path.extension().is_some_and(|e| e == SPOOL_EXT)
}

/// A spooled batch file. Removed when dropped.
#[derive(Debug)]
pub struct SpooledBatch {
    path: PathBuf,
}

impl SpooledBatch {
    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpooledBatch {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "spooled batch removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove spooled batch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceId;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn decode(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn quantity_wire_shape() {
        let mut batch = Batch::new();
        batch.insert(
            SourceId::from("Steps"),
            vec![Record::quantity("r-1", 42.0, at(1_000), at(61_000))
                .with_origin("com.apple.health", "iPhone")],
        );

        let json = decode(&encode_batch(&batch).unwrap());
        assert_eq!(
            json,
            json!({
                "steps": [{
                    "uuid": "r-1",
                    "value": 42.0,
                    "date_from": 1_000,
                    "date_to": 61_000,
                    "source_id": "com.apple.health",
                    "source_name": "iPhone"
                }]
            })
        );
    }

    #[test]
    fn category_and_workout_shapes() {
        let mut batch = Batch::new();
        let mut flow = Record::quantity("c-1", 0.0, at(0), at(1));
        flow.value = RecordValue::Category { value: 3 };
        batch.insert("menstrual_flow".into(), vec![flow]);

        let mut run = Record::quantity("w-1", 0.0, at(0), at(1_800_000));
        run.value = RecordValue::Workout {
            activity_type: Some("RUNNING".into()),
            total_energy_burned_kcal: Some(310.5),
            total_distance_m: None,
        };
        batch.insert("workout".into(), vec![run]);

        let json = decode(&encode_batch(&batch).unwrap());
        assert_eq!(json["menstrual_flow"][0]["value"], 3);

        let workout = &json["workout"][0];
        assert_eq!(workout["workoutActivityType"], "RUNNING");
        assert_eq!(workout["totalEnergyBurned"], 310.5);
        assert_eq!(workout["totalEnergyBurnedUnit"], "KILOCALORIE");
        assert_eq!(workout["totalDistance"], Value::Null);
        assert_eq!(workout["totalDistanceUnit"], "METER");
        assert!(workout.get("value").is_none());
    }

    #[test]
    fn non_finite_value_is_serialization_error() {
        let mut batch = Batch::new();
        batch.insert(
            "steps".into(),
            vec![Record::quantity("bad", f64::NAN, at(0), at(1))],
        );
        assert!(matches!(
            encode_batch(&batch),
            Err(SyncError::Serialization(_))
        ));
    }

    #[test]
    fn spooled_batch_removed_on_drop() {
        let dir = tempdir().unwrap();
        let spool = BatchSpool::open(dir.path().join("spool")).unwrap();

        let spooled = spool.write(b"{}").unwrap();
        assert!(spooled.path().exists());
        assert_eq!(fs::read(spooled.path()).unwrap(), b"{}");
        assert_eq!(spool.pending_files().unwrap().len(), 1);

        let path = spooled.path().to_path_buf();
        drop(spooled);
        assert!(!path.exists());
        assert!(spool.pending_files().unwrap().is_empty());
    }

    #[test]
    fn open_removes_stale_files_only() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("heka_batch_leftover.json"), b"{}").unwrap();
        fs::write(dir.path().join("unrelated.json"), b"{}").unwrap();

        let spool = BatchSpool::open(dir.path()).unwrap();
        assert!(spool.pending_files().unwrap().is_empty());
        assert!(dir.path().join("unrelated.json").exists());
    }
}
