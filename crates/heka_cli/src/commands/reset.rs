//! Reset-checkpoint command implementation.

use heka_sync_engine::{CheckpointStore, SourceId};
use tracing::info;

/// Removes the checkpoint of `source_id`.
///
/// The next cycle fetches the source's lookback window again. Records already
/// delivered are sent a second time.
pub fn run(store: &CheckpointStore, source_id: &SourceId) -> Result<(), Box<dyn std::error::Error>> {
    if store.try_get_checkpoint(source_id)?.is_none() {
        println!("No checkpoint stored for {source_id}");
        return Ok(());
    }
    store.clear_checkpoint(source_id)?;
    info!(source = %source_id, "checkpoint cleared");
    println!("✓ Checkpoint for {source_id} cleared");
    Ok(())
}
