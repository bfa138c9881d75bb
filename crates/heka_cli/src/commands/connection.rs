//! Connect and disconnect commands.

use super::CliError;
use chrono::{DateTime, Utc};
use heka_sync_engine::CheckpointStore;
use tracing::info;

/// Stores credentials. `last_sync_date` bounds the first sync window.
pub fn connect(
    store: &CheckpointStore,
    api_key: &str,
    user_id: &str,
    last_sync_date: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let last_sync_date = last_sync_date.map(parse_instant).transpose()?;
    store.mark_connected(api_key, user_id, last_sync_date)?;
    info!(user_id, "credentials stored");
    println!("✓ Connected as {user_id}");
    Ok(())
}

/// Clears credentials. Checkpoints stay so a reconnect resumes.
pub fn disconnect(store: &CheckpointStore) -> Result<(), Box<dyn std::error::Error>> {
    let checkpoints = store.checkpoints()?.len();
    store.mark_disconnected()?;
    println!("✓ Disconnected ({checkpoints} checkpoints kept)");
    Ok(())
}

/// Parses an RFC 3339 instant.
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>, CliError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CliError::InvalidArgument(format!("{value:?} is not RFC 3339: {e}")))
}
