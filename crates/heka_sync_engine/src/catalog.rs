//! Well-known source ids.
//!
//! Hosts may register adapters under any id; these are the ones the default
//! configuration and the aggregation API know about.

use crate::types::SourceId;

/// Step count samples.
pub const STEPS: &str = "steps";
/// Walking and running distance, meters.
pub const DISTANCE_WALKING_RUNNING: &str = "distance_walking_running";
/// Active energy burned, kilocalories.
pub const ACTIVE_ENERGY_BURNED: &str = "active_energy_burned";
/// Menstrual flow category samples.
pub const MENSTRUAL_FLOW: &str = "menstrual_flow";
/// Sleep analysis category samples.
pub const SLEEP_ANALYSIS: &str = "sleep_analysis";

/// Aggregate: distance moved, meters.
pub const DISTANCE_MOVED: &str = "distance_moved";
/// Aggregate: active calories, kilocalories.
pub const CALORIES: &str = "calories";
/// Aggregate: exercise minutes.
pub const EXERCISE_MINUTES: &str = "exercise_minutes";
/// Aggregate: floors climbed.
pub const FLOORS_CLIMBED: &str = "floors_climbed";
/// Aggregate: resting heart rate, beats per minute.
pub const RESTING_HEART_RATE: &str = "resting_heart_rate";
/// Aggregate: body weight, kilograms.
pub const WEIGHT: &str = "weight";
/// Aggregate: height, meters.
pub const HEIGHT: &str = "height";
/// Aggregate: blood oxygen saturation, percent.
pub const BLOOD_OXYGEN: &str = "blood_oxygen";
/// Aggregate: stand/move minutes.
pub const MOVE_MINUTES: &str = "move_minutes";

/// Sources fetched by a default sync cycle.
pub fn default_sync_sources() -> Vec<SourceId> {
    [
        STEPS,
        DISTANCE_WALKING_RUNNING,
        ACTIVE_ENERGY_BURNED,
        MENSTRUAL_FLOW,
        SLEEP_ANALYSIS,
    ]
    .into_iter()
    .map(SourceId::from)
    .collect()
}

/// Sources whose change notifications start a cycle by default.
pub fn default_trigger_sources() -> Vec<SourceId> {
    vec![SourceId::from(STEPS)]
}

/// Ids the aggregation API accepts by default.
pub fn aggregate_sources() -> Vec<SourceId> {
    [
        STEPS,
        DISTANCE_MOVED,
        CALORIES,
        EXERCISE_MINUTES,
        FLOORS_CLIMBED,
        RESTING_HEART_RATE,
        WEIGHT,
        HEIGHT,
        BLOOD_OXYGEN,
        MOVE_MINUTES,
    ]
    .into_iter()
    .map(SourceId::from)
    .collect()
}
