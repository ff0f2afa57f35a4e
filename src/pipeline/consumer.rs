//! Publishing finished files.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::TransferResult;
use super::progress::RecordOutcome;
use crate::config::PipelineConfig;
use crate::disk::DiskSpaceMonitor;
use crate::publish::{CaptionFormatter, PublishGate, PublishRequest, PublishSource};
use crate::store::RecordStore;

/// What a consumer did with one queued file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerOutcome {
    /// Sent to the channel and marked published.
    Published {
        /// Message id reported by the channel.
        message_id: Option<i64>,
    },
    /// Nothing to do.
    Skipped(String),
    /// Publishing failed; the record stays pending.
    Failed(String),
}

impl ConsumerOutcome {
    /// Batch classification of this outcome.
    #[must_use]
    pub fn outcome(&self) -> RecordOutcome {
        match self {
            Self::Published { .. } => RecordOutcome::Succeeded,
            Self::Skipped(_) => RecordOutcome::Skipped,
            Self::Failed(_) => RecordOutcome::Failed,
        }
    }
}

/// Publishes local files and updates the store.
#[derive(Clone)]
pub struct Consumer {
    store: RecordStore,
    gate: Arc<PublishGate>,
    monitor: Arc<DiskSpaceMonitor>,
    captions: Arc<dyn CaptionFormatter>,
    config: Arc<PipelineConfig>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("gate", &self.gate)
            .field("destination", &self.config.publish.destination)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new(
        store: RecordStore,
        gate: Arc<PublishGate>,
        monitor: Arc<DiskSpaceMonitor>,
        captions: Arc<dyn CaptionFormatter>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            store,
            gate,
            monitor,
            captions,
            config,
        }
    }

    /// Publishes one queued file.
    #[instrument(skip_all, fields(record_id = item.id))]
    pub async fn publish(&self, item: &TransferResult) -> ConsumerOutcome {
        let record = match self.store.get(item.id).await {
            Ok(Some(record)) => record,
            Ok(None) => return ConsumerOutcome::Skipped("record no longer exists".into()),
            Err(e) => return ConsumerOutcome::Failed(format!("could not load record: {e}")),
        };
        if record.published {
            debug!("already published");
            return ConsumerOutcome::Skipped("already published".into());
        }

        if !tokio::fs::try_exists(&item.local_path).await.unwrap_or(false) {
            warn!(path = %item.local_path.display(), "local file vanished, needs redownload");
            if let Err(e) = self.store.clear_local_path(item.id).await {
                warn!(error = %e, "could not clear local path");
            }
            return ConsumerOutcome::Failed("local file missing".into());
        }

        if !self.monitor.can_continue_publishing() {
            let wait = self.config.disk.space_wait;
            info!(wait_secs = wait.as_secs(), "free space is critical, pausing before publish");
            if !self.monitor.wait_for_publishing_room(wait).await {
                warn!("still critical after waiting, publishing anyway");
            }
        }

        let request = PublishRequest {
            source: PublishSource::File(item.local_path.clone()),
            caption: self.captions.caption(&record),
            destination: self.config.publish.destination.clone(),
            file_name: item.file_name(),
        };

        let receipt = match self.gate.publish(request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let note = e.to_string();
                if let Err(store_err) = self.store.note_error(item.id, &note).await {
                    warn!(error = %store_err, "could not record publish failure");
                }
                return ConsumerOutcome::Failed(note);
            }
        };

        if let Err(e) = self.store.mark_published(item.id).await {
            return ConsumerOutcome::Failed(format!("published but not recorded: {e}"));
        }
        info!(title = %item.title, bytes = item.size, "published");

        if self.config.delete_after_publish {
            self.release_local_copy(item).await;
        }

        ConsumerOutcome::Published {
            message_id: receipt.message_id,
        }
    }

    async fn release_local_copy(&self, item: &TransferResult) {
        match tokio::fs::remove_file(&item.local_path).await {
            Ok(()) => {
                debug!(path = %item.local_path.display(), "deleted published file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    path = %item.local_path.display(),
                    error = %e,
                    "could not delete published file"
                );
                return;
            }
        }
        if let Err(e) = self.store.clear_local_path(item.id).await {
            warn!(error = %e, "could not clear local path");
        }
        self.monitor.invalidate();
    }
}
