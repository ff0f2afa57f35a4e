//! Direct origin-to-channel relay.
//!
//! The origin body is tee'd: every chunk goes to the publisher through a
//! bounded channel and to a buffer file under `<download_dir>/.stream/`.
//! If the streamed publish fails transiently and the buffer is complete,
//! one more publish is attempted from the buffer, after the channel's
//! cooldown when it rate-limited the stream. The buffer counts against disk
//! admission like any download. It is always removed afterwards; streaming
//! never leaves a local copy behind.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::disk::DiskSpaceMonitor;
use crate::download::{
    CHUNK_BUFFER_BYTES, DownloadError, FailureType, TransferEngine, plan_path, validate_url,
};
use crate::pipeline::progress::RecordOutcome;
use crate::publish::{
    ByteStream, CaptionFormatter, PublishError, PublishGate, PublishReceipt, PublishRequest,
    PublishSource,
};
use crate::store::{FileRecord, RecordStore};

/// Directory under the download root holding in-flight stream buffers.
pub(crate) const STREAM_BUFFER_DIR: &str = ".stream";

/// Chunks in flight between the origin reader and the publisher.
const TEE_DEPTH: usize = 8;

/// What the relay did with one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Published and marked.
    Published {
        /// Message id reported by the channel.
        message_id: Option<i64>,
        /// Whether the buffered retry was needed.
        from_buffer: bool,
    },
    /// Nothing to do.
    Skipped(String),
    /// Relay failed; the record stays pending.
    Failed(String),
}

impl StreamOutcome {
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

/// Streams origin bodies straight into the publisher.
#[derive(Clone)]
pub struct StreamingRelay {
    store: RecordStore,
    engine: Arc<TransferEngine>,
    gate: Arc<PublishGate>,
    monitor: Arc<DiskSpaceMonitor>,
    captions: Arc<dyn CaptionFormatter>,
    config: Arc<PipelineConfig>,
}

impl std::fmt::Debug for StreamingRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRelay")
            .field("download_dir", &self.config.download_dir)
            .finish_non_exhaustive()
    }
}

impl StreamingRelay {
    /// Creates a relay.
    #[must_use]
    pub fn new(
        store: RecordStore,
        engine: Arc<TransferEngine>,
        gate: Arc<PublishGate>,
        monitor: Arc<DiskSpaceMonitor>,
        captions: Arc<dyn CaptionFormatter>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            store,
            engine,
            gate,
            monitor,
            captions,
            config,
        }
    }

    /// Relays one record from its origin to the channel.
    #[instrument(skip_all, fields(record_id = record.id))]
    pub async fn relay(&self, record: &FileRecord) -> StreamOutcome {
        if record.published {
            return StreamOutcome::Skipped("already published".into());
        }
        let Some(url) = record.remote_url() else {
            return StreamOutcome::Skipped("no remote url".into());
        };
        if let Err(e) = validate_url(url) {
            return StreamOutcome::Skipped(e.to_string());
        }

        let buffer = self.buffer_path(record, url);
        let outcome = self.relay_through(record, url, &buffer).await;
        match tokio::fs::remove_file(&buffer).await {
            Ok(()) => {
                debug!(path = %buffer.display(), "removed stream buffer");
                self.monitor.invalidate();
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %buffer.display(), error = %e, "could not remove stream buffer");
            }
        }
        outcome
    }

    fn buffer_path(&self, record: &FileRecord, url: &str) -> PathBuf {
        plan_path(
            &self.config.download_dir.join(STREAM_BUFFER_DIR),
            &record.source_collection,
            record.display_title(),
            record.id,
            url,
        )
    }

    async fn relay_through(&self, record: &FileRecord, url: &str, buffer: &Path) -> StreamOutcome {
        let response = match self.engine.open(url).await {
            Ok(response) => response,
            Err(e) => return self.download_failed(record.id, &e).await,
        };
        let length = response.content_length().filter(|n| *n > 0);

        let required = length.or_else(|| record.size_hint()).unwrap_or(0);
        if !super::admit(&self.monitor, &self.store, required).await {
            return StreamOutcome::Skipped(format!(
                "insufficient disk space for {required} bytes"
            ));
        }

        let file = match create_buffer(buffer).await {
            Ok(file) => file,
            Err(e) => return StreamOutcome::Failed(e.to_string()),
        };

        let (tx, rx) = mpsc::channel(TEE_DEPTH);
        let tee = tokio::spawn(tee_body(
            response,
            file,
            tx,
            url.to_string(),
            buffer.to_path_buf(),
        ));

        let caption = self.captions.caption(record);
        let file_name = buffer
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let request = PublishRequest {
            source: PublishSource::Stream {
                body: channel_stream(rx),
                length,
            },
            caption: caption.clone(),
            destination: self.config.publish.destination.clone(),
            file_name: file_name.clone(),
        };

        let streamed = self.gate.publish(request).await;
        let buffered = match tee.await {
            Ok(result) => result,
            Err(join_error) => {
                return StreamOutcome::Failed(format!("stream reader panicked: {join_error}"));
            }
        };

        let error = match streamed {
            Ok(receipt) => return self.published(record.id, receipt, false).await,
            Err(error) => error,
        };

        let written = match buffered {
            Ok(written) => written,
            Err(e) => return self.download_failed(record.id, &e).await,
        };
        let complete = length.is_none_or(|n| n == written);
        if error.failure_type() == FailureType::Permanent || !complete {
            return self.publish_failed(record.id, &error).await;
        }

        warn!(error = %error, bytes = written, "streamed publish failed, retrying from buffer");
        if let PublishError::RateLimited { retry_after } = &error {
            info!(wait_secs = retry_after.as_secs(), "waiting out channel cooldown");
            tokio::time::sleep(*retry_after).await;
        }
        let retry = PublishRequest {
            source: PublishSource::File(buffer.to_path_buf()),
            caption,
            destination: self.config.publish.destination.clone(),
            file_name,
        };
        match self.gate.publish(retry).await {
            Ok(receipt) => self.published(record.id, receipt, true).await,
            Err(error) => self.publish_failed(record.id, &error).await,
        }
    }

    async fn published(
        &self,
        id: i64,
        receipt: PublishReceipt,
        from_buffer: bool,
    ) -> StreamOutcome {
        if let Err(e) = self.store.mark_published(id).await {
            return StreamOutcome::Failed(format!("published but not recorded: {e}"));
        }
        info!(from_buffer, "relayed");
        StreamOutcome::Published {
            message_id: receipt.message_id,
            from_buffer,
        }
    }

    async fn publish_failed(&self, id: i64, error: &PublishError) -> StreamOutcome {
        let note = error.to_string();
        if let Err(e) = self.store.note_error(id, &note).await {
            warn!(error = %e, "could not record publish failure");
        }
        StreamOutcome::Failed(note)
    }

    async fn download_failed(&self, id: i64, error: &DownloadError) -> StreamOutcome {
        let note = error.to_string();
        if let Err(e) = self.store.record_failure(id, &note).await {
            warn!(error = %e, "could not record origin failure");
        }
        StreamOutcome::Failed(note)
    }
}

async fn create_buffer(path: &Path) -> Result<tokio::fs::File, DownloadError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }
    tokio::fs::File::create(path)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

fn channel_stream(rx: mpsc::Receiver<Result<Bytes, io::Error>>) -> ByteStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Copies the origin body into `file`, forwarding each chunk to `tx` while
/// the publisher keeps reading. Returns the bytes written.
async fn tee_body(
    response: reqwest::Response,
    file: tokio::fs::File,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    url: String,
    path: PathBuf,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::with_capacity(CHUNK_BUFFER_BYTES, file);
    let mut body = response.bytes_stream();
    let mut written = 0u64;
    let mut forwarding = true;

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let error = DownloadError::network(&url, e);
                if forwarding {
                    tx.send(Err(io::Error::other(error.to_string()))).await.ok();
                }
                return Err(error);
            }
        };

        if let Err(e) = writer.write_all(&chunk).await {
            if forwarding {
                tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await.ok();
            }
            return Err(DownloadError::io(&path, e));
        }
        written += chunk.len() as u64;

        if forwarding && tx.send(Ok(chunk)).await.is_err() {
            debug!(written, "publisher stopped reading, buffering only");
            forwarding = false;
        }
    }
    drop(tx);

    writer.flush().await.map_err(|e| DownloadError::io(&path, e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(&path, e))?;
    Ok(written)
}
