//! Status command implementation.

use heka_sync_engine::CheckpointStore;
use serde::Serialize;

/// Store state as shown by `heka status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Key holding the connection record.
    pub record_key: String,
    /// Whether syncing is enabled.
    pub connected: bool,
    /// Stored user id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Lower bound of the first sync window, RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_upload: Option<String>,
    /// Stored checkpoints.
    pub checkpoints: Vec<CheckpointEntry>,
}

/// One stored checkpoint.
#[derive(Debug, Serialize)]
pub struct CheckpointEntry {
    /// Source id.
    pub source: String,
    /// Token length in bytes.
    pub size: usize,
}

/// Runs the status command.
pub fn run(store: &CheckpointStore, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let connection = store.connection();
    let report = StatusReport {
        record_key: store.record_key().to_string(),
        connected: connection.is_connected(),
        user_id: connection.credentials().map(|c| c.user_id),
        first_upload: connection.first_upload.map(|t| t.to_rfc3339()),
        checkpoints: store
            .checkpoints()?
            .into_iter()
            .map(|(source, checkpoint)| CheckpointEntry {
                source: source.to_string(),
                size: checkpoint.as_bytes().len(),
            })
            .collect(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &StatusReport) {
    println!("Store record: {}", report.record_key);
    println!(
        "Connection:   {}",
        if report.connected { "connected" } else { "disconnected" }
    );
    if let Some(user_id) = &report.user_id {
        println!("User:         {user_id}");
    }
    if let Some(first_upload) = &report.first_upload {
        println!("Syncs from:   {first_upload}");
    }
    if report.checkpoints.is_empty() {
        println!("Checkpoints:  none");
        return;
    }
    println!("Checkpoints:");
    for entry in &report.checkpoints {
        println!("  {:<28} {} bytes", entry.source, entry.size);
    }
}
