//! Download and publish pipeline.
//!
//! A [`Producer`] turns one pending record into a local file (or decides to
//! skip it), a [`Consumer`] publishes a finished file and updates the store,
//! and the [`Orchestrator`] wires them together in one of the
//! [`RunMode`](crate::config::RunMode)s. [`StreamingRelay`] pipes an origin
//! body straight into the publisher without keeping the file.

mod consumer;
mod orchestrator;
mod producer;
mod progress;
mod streaming;

pub use consumer::{Consumer, ConsumerOutcome};
pub use orchestrator::Orchestrator;
pub use producer::{Producer, ProducerOutcome};
pub use progress::{BatchProgress, BatchSummary, RecordOutcome};
pub use streaming::{StreamOutcome, StreamingRelay};

use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use crate::disk::DiskSpaceMonitor;
use crate::store::{FileRecord, RecordStore, StoreError};

/// Queue payload handed from a producer to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Record id.
    pub id: i64,
    /// Local file to publish.
    pub local_path: PathBuf,
    /// Size of the local file.
    pub size: u64,
    /// Display title, used for logging and the presented file name fallback.
    pub title: String,
}

impl TransferResult {
    /// Builds a payload from a record that already has a local copy.
    #[must_use]
    pub fn from_record(record: &FileRecord) -> Option<Self> {
        let local_path = record.local_path_buf()?;
        Some(Self {
            id: record.id,
            local_path,
            size: u64::try_from(record.local_size).unwrap_or(0),
            title: record.display_title().to_string(),
        })
    }

    /// File name presented to the channel.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| {
                let stem = crate::download::sanitize_filename_component(&self.title);
                format!("{stem}_{}", self.id)
            })
    }
}

/// Disk admission shared by the producer and the streaming relay.
///
/// Files of unpublished records are kept out of reclaim. If they cannot be
/// listed, nothing is reclaimed.
pub(crate) async fn admit(monitor: &DiskSpaceMonitor, store: &RecordStore, required: u64) -> bool {
    if monitor.has_space_for(required) {
        return true;
    }
    let keep = match store.unpublished_local_paths().await {
        Ok(paths) => Some(paths),
        Err(e) => {
            warn!(error = %e, "could not list queued files, skipping reclaim");
            None
        }
    };
    monitor.admit(required, keep.as_deref()).await
}

/// Errors that abort a whole run before any record is processed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Listing the batch failed.
    #[error("could not load records: {0}")]
    Store(#[from] StoreError),

    /// The run needs a publisher but upload concurrency is zero.
    #[error("publishing is disabled (upload concurrency is 0)")]
    PublishingDisabled,
}
