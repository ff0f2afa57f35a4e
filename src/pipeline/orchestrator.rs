//! Run modes: sequential, bounded parallel, streaming, publish-only.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::consumer::Consumer;
use super::producer::{Producer, ProducerOutcome};
use super::progress::{BatchProgress, BatchSummary, NOTIFY_FLUSH_TIMEOUT, RecordOutcome};
use super::streaming::StreamingRelay;
use super::{PipelineError, TransferResult};
use crate::config::{PipelineConfig, RunMode};
use crate::disk::DiskSpaceMonitor;
use crate::download::TransferEngine;
use crate::publish::{CaptionFormatter, DefaultCaption, LogNotifier, Notifier, PublishGate};
use crate::store::{FileRecord, RecordStore};

/// Wires producers and consumers for one collection at a time.
#[derive(Clone)]
pub struct Orchestrator {
    store: RecordStore,
    engine: Arc<TransferEngine>,
    gate: Arc<PublishGate>,
    monitor: Arc<DiskSpaceMonitor>,
    notifier: Arc<dyn Notifier>,
    captions: Arc<dyn CaptionFormatter>,
    config: Arc<PipelineConfig>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator that logs notifications and uses the default caption.
    #[must_use]
    pub fn new(
        store: RecordStore,
        engine: Arc<TransferEngine>,
        gate: Arc<PublishGate>,
        monitor: Arc<DiskSpaceMonitor>,
        config: PipelineConfig,
    ) -> Self {
        let captions = Arc::new(DefaultCaption::new(config.publish.caption_limit));
        Self {
            store,
            engine,
            gate,
            monitor,
            notifier: Arc::new(LogNotifier),
            captions,
            config: Arc::new(config),
        }
    }

    /// Replaces the notification sink.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replaces the caption formatter.
    #[must_use]
    pub fn with_captions(mut self, captions: Arc<dyn CaptionFormatter>) -> Self {
        self.captions = captions;
        self
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn producer(&self) -> Producer {
        Producer::new(
            self.store.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.monitor),
            Arc::clone(&self.config),
        )
    }

    fn consumer(&self) -> Consumer {
        Consumer::new(
            self.store.clone(),
            Arc::clone(&self.gate),
            Arc::clone(&self.monitor),
            Arc::clone(&self.captions),
            Arc::clone(&self.config),
        )
    }

    fn relay(&self) -> StreamingRelay {
        StreamingRelay::new(
            self.store.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.gate),
            Arc::clone(&self.monitor),
            Arc::clone(&self.captions),
            Arc::clone(&self.config),
        )
    }

    fn progress(&self, label: &str, total: usize) -> BatchProgress {
        BatchProgress::new(label, total, Some(Arc::clone(&self.notifier)))
    }

    /// Downloads and publishes every unpublished record of `collection` in the configured mode.
    ///
    /// With upload concurrency `0` this is the same as [`Self::download_only`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] if the batch cannot be listed.
    /// Individual record failures are counted, never returned.
    #[instrument(skip(self), fields(mode = ?self.config.mode))]
    pub async fn run(&self, collection: &str) -> Result<BatchSummary, PipelineError> {
        if !self.config.publishes() {
            return self.download_only(collection).await;
        }

        let records = self
            .store
            .list_unpublished(collection, self.config.batch_limit)
            .await?;
        info!(count = records.len(), "starting run");
        let progress = self.progress(collection, records.len());

        match self.config.mode {
            RunMode::Sequential => self.run_sequential(records, &progress).await,
            RunMode::Parallel => {
                self.run_parallel(records, self.producer(), true, &progress)
                    .await;
            }
            RunMode::Streaming => self.run_streaming(records, &progress).await,
        }

        Ok(finish(&progress).await)
    }

    /// Downloads pending records without publishing them.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] if the batch cannot be listed.
    #[instrument(skip(self))]
    pub async fn download_only(&self, collection: &str) -> Result<BatchSummary, PipelineError> {
        let records = self
            .store
            .list_pending(collection, self.config.batch_limit)
            .await?;
        info!(count = records.len(), "starting download-only run");
        let progress = self.progress(collection, records.len());
        let producer = self.producer().download_only();

        if self.config.mode == RunMode::Sequential {
            for record in records {
                let producer = producer.clone();
                let outcome = catch_panic(async move { producer.process(&record).await.outcome() })
                    .await
                    .unwrap_or(RecordOutcome::Failed);
                progress.record(outcome);
            }
        } else {
            self.run_parallel(records, producer, false, &progress)
                .await;
        }

        Ok(finish(&progress).await)
    }

    /// Publishes records that are already downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PublishingDisabled`] when upload concurrency is `0`,
    /// or [`PipelineError::Store`] if the batch cannot be listed.
    #[instrument(skip(self))]
    pub async fn publish_only(&self, collection: &str) -> Result<BatchSummary, PipelineError> {
        if !self.config.publishes() {
            return Err(PipelineError::PublishingDisabled);
        }
        let records = self
            .store
            .list_downloaded_unpublished(collection, self.config.batch_limit)
            .await?;
        info!(count = records.len(), "starting publish-only run");
        let progress = self.progress(collection, records.len());

        let (tx, workers) = self.spawn_consumers(&progress);
        for record in &records {
            match TransferResult::from_record(record) {
                Some(item) => {
                    if tx.send(item).await.is_err() {
                        progress.record(RecordOutcome::Failed);
                    }
                }
                None => progress.record(RecordOutcome::Skipped),
            }
        }
        drop(tx);
        join_workers(workers).await;

        Ok(finish(&progress).await)
    }

    /// One record at a time, download then publish, in input order.
    async fn run_sequential(&self, records: Vec<FileRecord>, progress: &BatchProgress) {
        let producer = self.producer();
        let consumer = self.consumer();
        for record in records {
            let producer = producer.clone();
            let consumer = consumer.clone();
            let outcome = catch_panic(async move {
                match producer.process(&record).await {
                    ProducerOutcome::Queued(item) => consumer.publish(&item).await.outcome(),
                    other => other.outcome(),
                }
            })
            .await
            .unwrap_or(RecordOutcome::Failed);
            progress.record(outcome);
        }
    }

    /// Download workers bounded by a semaphore, feeding a bounded queue
    /// drained by the publish workers.
    async fn run_parallel(
        &self,
        records: Vec<FileRecord>,
        producer: Producer,
        publish: bool,
        progress: &BatchProgress,
    ) {
        let downloads = Arc::new(Semaphore::new(self.config.download_concurrency));
        let (tx, consumers) = if publish {
            let (tx, workers) = self.spawn_consumers(progress);
            (Some(tx), workers)
        } else {
            (None, Vec::new())
        };

        let mut producers: Vec<JoinHandle<()>> = Vec::with_capacity(records.len());
        for record in records {
            let Ok(permit) = Arc::clone(&downloads).acquire_owned().await else {
                warn!("download semaphore closed");
                progress.record(RecordOutcome::Failed);
                continue;
            };
            let producer = producer.clone();
            let tx = tx.clone();
            let progress = progress.clone();

            producers.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = catch_panic(async move { producer.process(&record).await }).await;
                match outcome {
                    Some(ProducerOutcome::Queued(item)) => match &tx {
                        Some(tx) => {
                            if tx.send(item).await.is_err() {
                                warn!("publish queue closed, dropping item");
                                progress.record(RecordOutcome::Failed);
                            }
                        }
                        None => progress.record(RecordOutcome::Succeeded),
                    },
                    Some(other) => progress.record(other.outcome()),
                    None => progress.record(RecordOutcome::Failed),
                }
            }));
        }
        drop(tx);

        debug!(task_count = producers.len(), "waiting for downloads to finish");
        for handle in producers {
            if let Err(e) = handle.await {
                warn!(error = %e, "producer task panicked");
                progress.record(RecordOutcome::Failed);
            }
        }
        join_workers(consumers).await;
    }

    /// One relay task per record, one at a time; a record with a usable local
    /// copy is published from disk instead.
    async fn run_streaming(&self, records: Vec<FileRecord>, progress: &BatchProgress) {
        let relay = self.relay();
        let consumer = self.consumer();
        for record in records {
            let local = TransferResult::from_record(&record)
                .filter(|item| item.local_path.is_file());
            let relay = relay.clone();
            let consumer = consumer.clone();
            let outcome = catch_panic(async move {
                match local {
                    Some(item) => consumer.publish(&item).await.outcome(),
                    None => relay.relay(&record).await.outcome(),
                }
            })
            .await
            .unwrap_or(RecordOutcome::Failed);
            progress.record(outcome);
        }
    }

    /// Spawns the publish workers sharing one receiver.
    fn spawn_consumers(
        &self,
        progress: &BatchProgress,
    ) -> (mpsc::Sender<TransferResult>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<TransferResult>(self.config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..self.config.upload_concurrency.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let consumer = self.consumer();
                let progress = progress.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(item) = next else {
                            debug!(worker, "publish queue drained");
                            break;
                        };
                        let consumer = consumer.clone();
                        let outcome =
                            catch_panic(async move { consumer.publish(&item).await.outcome() })
                                .await
                                .unwrap_or(RecordOutcome::Failed);
                        progress.record(outcome);
                    }
                })
            })
            .collect();
        (tx, workers)
    }
}

/// Runs `task` on its own tokio task; `None` means it panicked.
async fn catch_panic<F, T>(task: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "record task panicked");
            None
        }
    }
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "publish worker panicked");
        }
    }
}

async fn finish(progress: &BatchProgress) -> BatchSummary {
    let summary = progress.finish(NOTIFY_FLUSH_TIMEOUT).await;
    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        skipped = summary.skipped,
        failed = summary.failed,
        elapsed_ms = summary.elapsed.as_millis(),
        "batch complete"
    );
    summary
}
