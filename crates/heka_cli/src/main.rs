//! Heka CLI
//!
//! Command-line tools for Heka sync state.
//!
//! # Commands
//!
//! - `status` - Show connection state and stored checkpoints
//! - `connect` - Store credentials and enable syncing
//! - `disconnect` - Clear credentials, keeping checkpoints
//! - `reset-checkpoint` - Forget one source's checkpoint
//! - `sync` - Run one sync cycle from JSON record files

mod commands;
mod http;

use clap::{Parser, Subcommand};
use heka_sync_engine::SourceId;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Heka sync command-line tools.
#[derive(Parser)]
#[command(name = "heka")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store file
    #[arg(global = true, short, long)]
    store: Option<PathBuf>,

    /// Key namespace inside the store
    #[arg(global = true, short, long, default_value = "")]
    namespace: String,

    /// Passphrase for an encrypted store
    #[arg(global = true, long, env = "HEKA_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connection state and stored checkpoints
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Store credentials and enable syncing
    Connect {
        /// Collector API key
        #[arg(long)]
        api_key: String,

        /// User id sent with every upload
        #[arg(long)]
        user_id: String,

        /// Earliest instant to sync from (RFC 3339)
        #[arg(long)]
        last_sync_date: Option<String>,
    },

    /// Clear credentials, keeping checkpoints
    Disconnect,

    /// Forget one source's checkpoint so it re-syncs its lookback window
    ResetCheckpoint {
        /// Source id
        source: String,
    },

    /// Run one sync cycle from JSON record files
    Sync {
        /// Source and its record file, as `<source>=<path>`; repeatable
        #[arg(long = "source", value_parser = commands::sync::parse_source_arg, required = true)]
        sources: Vec<(SourceId, PathBuf)>,

        /// Collector base URL
        #[arg(long)]
        endpoint: Option<String>,

        /// Upload attempts before giving up
        #[arg(long, default_value = "3")]
        attempts: u32,

        /// Lookback in days for sources without a checkpoint
        #[arg(long, default_value = "7")]
        lookback_days: u64,

        /// Print the batch instead of uploading it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Version = cli.command {
        println!("Heka CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let path = cli.store.ok_or("Store path required (--store)")?;
    let backend = commands::open_store(&path, cli.passphrase.as_deref())?;
    let store = commands::checkpoint_store(backend, &cli.namespace);

    match cli.command {
        Commands::Status { format } => {
            commands::status::run(&store, &format)?;
        }
        Commands::Connect {
            api_key,
            user_id,
            last_sync_date,
        } => {
            commands::connection::connect(&store, &api_key, &user_id, last_sync_date.as_deref())?;
        }
        Commands::Disconnect => {
            commands::connection::disconnect(&store)?;
        }
        Commands::ResetCheckpoint { source } => {
            commands::reset::run(&store, &SourceId::from(source))?;
        }
        Commands::Sync {
            sources,
            endpoint,
            attempts,
            lookback_days,
            dry_run,
        } => {
            let lookback = commands::sync::lookback_from_days(lookback_days)?;
            let options = commands::sync::SyncOptions {
                sources,
                endpoint,
                attempts,
                lookback,
                namespace: cli.namespace,
                dry_run,
            };
            commands::sync::run(store, options).await?;
        }
        Commands::Version => {}
    }

    Ok(())
}
