//! Media Relay Core Library
//!
//! Downloads tracked media files from their origins and republishes them to
//! a Telegram channel. State lives in SQLite so runs are idempotent and
//! resumable across restarts, crashes and disk-space exhaustion.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`store`] - Tracked file records and their download/publish state
//! - [`disk`] - Free-space admission, waits and stale-file eviction
//! - [`download`] - Resumable HTTP transfers with retry and backoff
//! - [`publish`] - Remote publish boundary, single-flight gate, Bot API client
//! - [`pipeline`] - Producers, consumers and the run orchestrator
//! - [`config`] - Runtime configuration and validation

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod disk;
pub mod download;
pub mod pipeline;
pub mod publish;
pub mod store;

#[cfg(test)]
mod test_support;

/// Name of the run lock file kept in the download directory.
pub const LOCK_FILE_NAME: &str = ".media-relay.lock";

// Re-export commonly used types
pub use config::{ConfigError, DiskSpaceConfig, PipelineConfig, PublishConfig, RunMode};
pub use db::{Database, DatabaseOptions, DbError};
pub use disk::{DiskSpaceMonitor, SpaceProbe, StatvfsProbe};
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, FailureType, HttpClient, RateLimiter, RetryDecision,
    RetryPolicy, TransferEngine, TransferFailure, TransferOutcome, classify_error,
};
pub use pipeline::{
    BatchProgress, BatchSummary, Consumer, Orchestrator, PipelineError, Producer, StreamingRelay,
    TransferResult,
};
pub use publish::{
    BotApi, BotApiNotifier, BotApiPublisher, CaptionFormatter, DefaultCaption, LogNotifier,
    Notifier, PublishError, PublishGate, PublishReceipt, PublishRequest, PublishSource, Publisher,
};
pub use store::{
    CollectionCounts, FileRecord, NewFileRecord, RecordMetadata, RecordStore, StoreError,
};
