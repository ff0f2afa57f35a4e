//! Per-record download decisions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::TransferResult;
use super::progress::RecordOutcome;
use crate::config::PipelineConfig;
use crate::disk::DiskSpaceMonitor;
use crate::download::integrity::check_size;
use crate::download::{RemoteProbe, TransferEngine, plan_path, validate_url};
use crate::store::{FileRecord, RecordStore};

/// What a producer did with one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerOutcome {
    /// A local file is ready for a consumer.
    Queued(TransferResult),
    /// The file is on disk; nothing will publish it in this run.
    DownloadOnlyDone(TransferResult),
    /// Left for a later run.
    Skipped(String),
    /// Download failed or produced a bad file.
    Failed(String),
}

impl ProducerOutcome {
    /// Batch classification of this outcome, assuming nothing happens downstream.
    #[must_use]
    pub fn outcome(&self) -> RecordOutcome {
        match self {
            Self::Queued(_) | Self::DownloadOnlyDone(_) => RecordOutcome::Succeeded,
            Self::Skipped(_) => RecordOutcome::Skipped,
            Self::Failed(_) => RecordOutcome::Failed,
        }
    }
}

/// How an existing local file relates to the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalFile {
    /// Nothing on disk.
    Absent,
    /// Complete within tolerance; use as-is.
    Reuse(u64),
    /// A prefix of a range-capable resource; continue it.
    Resume { have: u64, total: u64 },
    /// Remote size unknown right now; keep the file and let the transfer
    /// decide between resuming and restarting.
    Keep(u64),
    /// Fails the size check, but space is too low to replace it.
    PublishAsIs(u64),
    /// Fails the size check; delete and start over.
    Replace,
}

/// Turns pending records into local files.
#[derive(Debug, Clone)]
pub struct Producer {
    store: RecordStore,
    engine: Arc<TransferEngine>,
    monitor: Arc<DiskSpaceMonitor>,
    config: Arc<PipelineConfig>,
    hand_off: bool,
}

impl Producer {
    /// Creates a producer; finished files are queued when the config publishes.
    #[must_use]
    pub fn new(
        store: RecordStore,
        engine: Arc<TransferEngine>,
        monitor: Arc<DiskSpaceMonitor>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let hand_off = config.publishes();
        Self {
            store,
            engine,
            monitor,
            config,
            hand_off,
        }
    }

    /// Keeps finished files local instead of queueing them.
    #[must_use]
    pub fn download_only(mut self) -> Self {
        self.hand_off = false;
        self
    }

    /// Runs the full decision pipeline for one record.
    #[instrument(skip_all, fields(record_id = record.id))]
    pub async fn process(&self, record: &FileRecord) -> ProducerOutcome {
        if record.published {
            return ProducerOutcome::Skipped("already published".into());
        }
        let Some(url) = record.remote_url() else {
            return ProducerOutcome::Skipped("no remote url".into());
        };
        if let Err(e) = validate_url(url) {
            debug!(error = %e, "rejecting record");
            return ProducerOutcome::Skipped(e.to_string());
        }

        let destination = record.local_path_buf().unwrap_or_else(|| {
            plan_path(
                &self.config.download_dir,
                &record.source_collection,
                record.display_title(),
                record.id,
                url,
            )
        });

        let (local, probe) = self.inspect_local(record, url, &destination).await;
        let required = match local {
            LocalFile::Reuse(size) | LocalFile::PublishAsIs(size) => {
                return self.adopt(record, &destination, size).await;
            }
            LocalFile::Resume { have, total } => {
                info!(have, total, "resuming partial file");
                total.saturating_sub(have)
            }
            LocalFile::Keep(have) => {
                info!(have, "keeping local file until the origin answers");
                record.size_hint().map_or(0, |hint| hint.saturating_sub(have))
            }
            LocalFile::Replace => {
                remove_quietly(&destination).await;
                self.monitor.invalidate();
                self.required_bytes(record, url, probe).await
            }
            LocalFile::Absent => self.required_bytes(record, url, probe).await,
        };

        if !super::admit(&self.monitor, &self.store, required).await {
            return ProducerOutcome::Skipped(format!(
                "insufficient disk space for {required} bytes"
            ));
        }

        self.download(record, url, &destination).await
    }

    /// Classifies whatever is already at `destination`.
    async fn inspect_local(
        &self,
        record: &FileRecord,
        url: &str,
        destination: &Path,
    ) -> (LocalFile, Option<RemoteProbe>) {
        let len = match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            _ => return (LocalFile::Absent, None),
        };

        let probe = match self.engine.probe(url).await {
            Ok(probe) => Some(probe),
            Err(e) => {
                debug!(error = %e, "probe failed, judging local file by recorded size");
                None
            }
        };

        let verdict = match probe.and_then(|p| p.total.map(|total| (total, p.accepts_ranges))) {
            Some((total, _)) if len >= total && check_size(len, total) => LocalFile::Reuse(len),
            Some((total, true)) if len < total => LocalFile::Resume { have: len, total },
            Some((total, false)) if check_size(len, total) => LocalFile::Reuse(len),
            Some((total, _)) => {
                warn!(len, total, "local file fails the size check");
                self.invalid_file(len)
            }
            None => {
                let recorded = u64::try_from(record.local_size).unwrap_or(0);
                if recorded > 0 && check_size(len, recorded) {
                    LocalFile::Reuse(len)
                } else {
                    LocalFile::Keep(len)
                }
            }
        };
        debug!(?verdict, "inspected local file");
        (verdict, probe)
    }

    fn invalid_file(&self, len: u64) -> LocalFile {
        if self.config.publish_partial_on_low_space && !self.monitor.can_continue_publishing() {
            warn!(len, "space is critical, publishing the local file as-is");
            LocalFile::PublishAsIs(len)
        } else {
            LocalFile::Replace
        }
    }

    /// Bytes a fresh download needs: the size hint, else the probed total.
    async fn required_bytes(
        &self,
        record: &FileRecord,
        url: &str,
        probe: Option<RemoteProbe>,
    ) -> u64 {
        if let Some(hint) = record.size_hint() {
            return hint;
        }
        if let Some(total) = probe.and_then(|p| p.total) {
            return total;
        }
        match self.engine.probe(url).await {
            Ok(probe) => probe.total.unwrap_or(0),
            Err(e) => {
                debug!(error = %e, "size probe failed, admitting with unknown size");
                0
            }
        }
    }

    async fn download(
        &self,
        record: &FileRecord,
        url: &str,
        destination: &Path,
    ) -> ProducerOutcome {
        let outcome = match self.engine.download(url, destination).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                let note = failure.to_string();
                if let Err(e) = self.store.record_failure(record.id, &note).await {
                    warn!(error = %e, "could not record download failure");
                }
                return ProducerOutcome::Failed(note);
            }
        };

        if let Some(expected) = outcome.expected_bytes
            && !check_size(outcome.bytes_on_disk, expected)
        {
            let note = format!(
                "integrity mismatch: {} bytes on disk, {expected} expected",
                outcome.bytes_on_disk
            );
            warn!(%note, "discarding downloaded file");
            remove_quietly(destination).await;
            if let Err(e) = self.store.record_failure(record.id, &note).await {
                warn!(error = %e, "could not record integrity failure");
            }
            return ProducerOutcome::Failed(note);
        }

        self.monitor.invalidate();
        self.adopt(record, destination, outcome.bytes_on_disk).await
    }

    /// Records the local file and dispatches it.
    async fn adopt(&self, record: &FileRecord, path: &Path, size: u64) -> ProducerOutcome {
        let already_recorded = record.local_path_buf().as_deref() == Some(path)
            && u64::try_from(record.local_size).ok() == Some(size);
        if !already_recorded
            && let Err(e) = self.store.mark_downloaded(record.id, path, size).await
        {
            return ProducerOutcome::Failed(format!("could not record download: {e}"));
        }

        let result = TransferResult {
            id: record.id,
            local_path: PathBuf::from(path),
            size,
            title: record.display_title().to_string(),
        };

        if self.hand_off {
            return ProducerOutcome::Queued(result);
        }

        if self.monitor.is_below_threshold() {
            match self.store.unpublished_local_paths().await {
                Ok(keep) => {
                    let removed = self
                        .monitor
                        .reclaim_stale_files(self.config.disk.stale_file_age, &keep)
                        .await;
                    debug!(removed, "post-download cleanup");
                }
                Err(e) => warn!(error = %e, "could not list queued files, skipping cleanup"),
            }
        }
        ProducerOutcome::DownloadOnlyDone(result)
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed local file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove local file"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, ResponseTemplate};

    use crate::config::DiskSpaceConfig;
    use crate::db::Database;
    use crate::disk::SpaceProbe;
    use crate::download::{HttpClient, RateLimiter, RetryPolicy};
    use crate::store::NewFileRecord;
    use crate::test_support::start_mock_server_or_skip;

    #[derive(Debug)]
    struct Plenty;

    impl SpaceProbe for Plenty {
        fn available_bytes(&self, _path: &Path) -> std::io::Result<u64> {
            Ok(u64::MAX / 2)
        }
    }

    #[derive(Debug)]
    struct Starved;

    impl SpaceProbe for Starved {
        fn available_bytes(&self, _path: &Path) -> std::io::Result<u64> {
            Ok(0)
        }
    }

    /// Reads as full until something is deleted, then as empty.
    #[derive(Debug, Default)]
    struct FullUntilDelete {
        reads: AtomicUsize,
    }

    impl SpaceProbe for FullUntilDelete {
        fn available_bytes(&self, _path: &Path) -> std::io::Result<u64> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(0)
            } else {
                Ok(u64::MAX / 2)
            }
        }
    }

    const TWO_MIB: usize = 2 * 1024 * 1024;

    async fn fixture(
        dir: &TempDir,
        probe: Arc<dyn SpaceProbe>,
        url: &str,
    ) -> (Producer, RecordStore, FileRecord) {
        fixture_with(dir, probe, url, |_| {}).await
    }

    async fn fixture_with(
        dir: &TempDir,
        probe: Arc<dyn SpaceProbe>,
        url: &str,
        configure: impl FnOnce(&mut PipelineConfig),
    ) -> (Producer, RecordStore, FileRecord) {
        let store = RecordStore::new(Database::new_in_memory().await.unwrap());
        let id = store
            .insert(
                "site",
                &NewFileRecord {
                    page: "https://site/p/1".into(),
                    url: Some(url.into()),
                    size_hint: None,
                    metadata: crate::store::RecordMetadata {
                        title: Some("Clip".into()),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap()
            .unwrap();
        let record = store.get(id).await.unwrap().unwrap();

        let mut config = PipelineConfig {
            download_dir: dir.path().to_path_buf(),
            disk: DiskSpaceConfig {
                min_free_bytes: 10,
                critical_free_bytes: 5,
                space_wait: Duration::ZERO,
                ..DiskSpaceConfig::default()
            },
            ..PipelineConfig::default()
        };
        configure(&mut config);
        let monitor = DiskSpaceMonitor::with_probe(dir.path(), &config.disk, probe);
        let engine = TransferEngine::new(
            HttpClient::new().unwrap(),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1), 1.0)
                .without_jitter(),
            Arc::new(RateLimiter::disabled()),
        );
        let producer = Producer::new(
            store.clone(),
            Arc::new(engine),
            Arc::new(monitor),
            Arc::new(config),
        );
        (producer, store, record)
    }

    #[tokio::test]
    async fn test_published_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (producer, store, record) =
            fixture(&dir, Arc::new(Plenty), "https://cdn.example.com/a.mp4").await;
        store.mark_published(record.id).await.unwrap();
        let record = store.get(record.id).await.unwrap().unwrap();

        assert_eq!(
            producer.process(&record).await,
            ProducerOutcome::Skipped("already published".into())
        );
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (producer, _store, record) =
            fixture(&dir, Arc::new(Plenty), "ftp://cdn.example.com/a.mp4").await;

        assert!(matches!(
            producer.process(&record).await,
            ProducerOutcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn test_no_space_skips_without_request() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "64"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let url = format!("{}/clip.mp4", server.uri());
        let (producer, store, record) = fixture(&dir, Arc::new(Starved), &url).await;

        let outcome = producer.process(&record).await;
        assert!(matches!(outcome, ProducerOutcome::Skipped(ref r) if r.contains("disk space")));
        let after = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(after.failed_attempts, 0);
        assert!(after.local_path.is_none());
    }

    #[tokio::test]
    async fn test_download_records_local_file() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "2048"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 2048]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let url = format!("{}/clip.mp4", server.uri());
        let (producer, store, record) = fixture(&dir, Arc::new(Plenty), &url).await;

        let ProducerOutcome::Queued(result) = producer.process(&record).await else {
            panic!("expected a queued result");
        };
        assert_eq!(result.size, 2048);
        assert_eq!(result.local_path, dir.path().join("site").join("Clip_1.mp4"));

        let after = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(after.local_size, 2048);
        assert!(after.downloaded_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_download_increments_attempts() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let url = format!("{}/gone.mp4", server.uri());
        let (producer, store, record) = fixture(&dir, Arc::new(Plenty), &url).await;

        assert!(matches!(
            producer.process(&record).await,
            ProducerOutcome::Failed(_)
        ));
        let after = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(after.failed_attempts, 1);
        assert!(after.last_error.is_some());
    }

    #[tokio::test]
    async fn test_download_only_keeps_file_local() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "16"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 16]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let url = format!("{}/clip.mp4", server.uri());
        let (producer, _store, record) = fixture(&dir, Arc::new(Plenty), &url).await;

        let outcome = producer.download_only().process(&record).await;
        assert!(matches!(outcome, ProducerOutcome::DownloadOnlyDone(_)));
        assert_eq!(outcome.outcome(), RecordOutcome::Succeeded);
    }

    /// Origin advertising 2 MiB without range support.
    async fn mount_two_mib_origin(server: &wiremock::MockServer, gets: u64) {
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Content-Length", TWO_MIB.to_string()),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![4u8; TWO_MIB]))
            .expect(gets)
            .mount(server)
            .await;
    }

    fn write_short_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("site").join("Clip_1.mp4");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![4u8; 1000]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_short_file_is_published_as_is_under_critical_space() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_two_mib_origin(&server, 0).await;

        let dir = TempDir::new().unwrap();
        let local = write_short_file(&dir);
        let url = format!("{}/clip.mp4", server.uri());
        let (producer, store, record) =
            fixture(&dir, Arc::new(FullUntilDelete::default()), &url).await;

        let ProducerOutcome::Queued(result) = producer.process(&record).await else {
            panic!("expected the short file to be queued");
        };
        assert_eq!(result.size, 1000);
        assert_eq!(result.local_path, local);
        assert_eq!(std::fs::metadata(&local).unwrap().len(), 1000);
        assert_eq!(store.get(record.id).await.unwrap().unwrap().local_size, 1000);
    }

    #[tokio::test]
    async fn test_short_file_is_replaced_when_partial_publishing_is_off() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_two_mib_origin(&server, 1).await;

        let dir = TempDir::new().unwrap();
        let local = write_short_file(&dir);
        let url = format!("{}/clip.mp4", server.uri());
        let (producer, _store, record) =
            fixture_with(&dir, Arc::new(FullUntilDelete::default()), &url, |config| {
                config.publish_partial_on_low_space = false;
            })
            .await;

        let ProducerOutcome::Queued(result) = producer.process(&record).await else {
            panic!("expected a fresh download");
        };
        assert_eq!(result.size, TWO_MIB as u64);
        assert_eq!(std::fs::metadata(&local).unwrap().len(), TWO_MIB as u64);
    }

    #[tokio::test]
    async fn test_reclaim_spares_files_waiting_for_publish() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "64"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64]))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let url = format!("{}/clip.mp4", server.uri());
        let (producer, store, record) = fixture_with(&dir, Arc::new(Starved), &url, |config| {
            config.disk.stale_file_age = Duration::ZERO;
        })
        .await;

        // Reused earlier and handed to a consumer, not yet published.
        let queued_id = store
            .insert(
                "site",
                &NewFileRecord {
                    page: "https://site/p/2".into(),
                    url: Some(url.clone()),
                    size_hint: None,
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap()
            .unwrap();
        let site = dir.path().join("site");
        std::fs::create_dir_all(&site).unwrap();
        let queued = site.join("Other_2.mp4");
        let leftover = site.join("Leftover_9.mp4");
        std::fs::write(&queued, b"queued").unwrap();
        std::fs::write(&leftover, b"stale").unwrap();
        store.mark_downloaded(queued_id, &queued, 6).await.unwrap();

        let outcome = producer.process(&record).await;

        assert!(matches!(outcome, ProducerOutcome::Skipped(ref r) if r.contains("disk space")));
        assert!(queued.exists());
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_unanswered_probe_keeps_prefix_for_resume() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-0"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=1000-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 1000-1999/2000")
                    .set_body_bytes(vec![9u8; 1000]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let local = dir.path().join("site").join("Clip_1.mp4");
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, vec![8u8; 1000]).unwrap();
        let url = format!("{}/clip.mp4", server.uri());
        let (producer, _store, record) = fixture(&dir, Arc::new(Plenty), &url).await;

        let ProducerOutcome::Queued(result) = producer.process(&record).await else {
            panic!("expected the resumed file to be queued");
        };
        assert_eq!(result.size, 2000);
        let bytes = std::fs::read(&local).unwrap();
        assert_eq!(&bytes[..1000], &[8u8; 1000][..]);
        assert_eq!(&bytes[1000..], &[9u8; 1000][..]);
    }
}
