//! # Heka Sync Engine
//!
//! Incremental, checkpointed synchronization of health records from several
//! independent sources to a remote collector.
//!
//! This crate provides:
//! - Per-source checkpoint (anchor) management over a durable key-value store
//! - Concurrent fan-out collection with per-source failure isolation
//! - A single-flight sync orchestrator with commit-on-success checkpoints
//! - Batch wire encoding and an HTTP uploader over a pluggable client
//! - Change-notification triggers and a host-facing [`HekaClient`]
//!
//! ## Sync cycle
//!
//! 1. Enter `InProgress` by compare-and-set, or report `AlreadyRunning`
//! 2. Fetch every source in parallel, resuming from its checkpoint
//! 3. Serialize all non-empty results into one batch and upload it
//! 4. On confirmed delivery, commit every new checkpoint in one write
//! 5. Return to `Idle` and report the outcome exactly once
//!
//! ## Key Invariants
//!
//! - A checkpoint only advances to a value returned alongside records whose
//!   upload was confirmed
//! - A failed or refused upload leaves the store byte-identical
//! - At most one cycle runs per orchestrator
//! - Delivery is at-least-once; duplicates across cycles are possible and the
//!   collector relies on server-side dedup by record uuid

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
pub mod catalog;
mod checkpoint;
mod client;
mod collector;
mod config;
mod error;
mod http;
mod orchestrator;
mod source;
mod state;
mod trigger;
mod types;
mod uploader;

pub use batch::{encode_batch, BatchSpool, SpooledBatch};
pub use checkpoint::CheckpointStore;
pub use client::{Authorizer, HekaClient, HekaClientBuilder, StaticAuthorizer};
pub use collector::{Collection, Collector, SourceFailure};
pub use config::{RetryConfig, SyncConfig, DEFAULT_LOOKBACK, MAX_LOOKBACK};
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpResponse, HttpUploader, HttpUploaderConfig, API_KEY_HEADER, USER_ID_HEADER,
};
pub use orchestrator::SyncOrchestrator;
pub use source::{FetchCall, FetchResult, MockSource, SourceAdapter, SourceRegistry};
pub use state::{SyncCycleReport, SyncOutcome, SyncState, SyncStats};
pub use trigger::{
    Ack, MockObserverPlatform, ObserverCallback, ObserverPlatform, TriggerHandler, TriggerHub,
};
pub use types::{
    Batch, Checkpoint, ConnectionState, ConnectionStatus, Credentials, FetchWindow,
    PendingCheckpointSet, Record, RecordValue, SourceId,
};
pub use uploader::{MockUploader, UploadBehavior, UploadCall, Uploader};
