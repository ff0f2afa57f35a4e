//! Shared fixtures for integration tests: a byte-range origin, a recording
//! publisher, simulated disks and a pipeline harness.

#![allow(dead_code)]

pub mod socket_guard;
pub mod truncating_origin;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use media_relay::{
    Database, DiskSpaceConfig, DiskSpaceMonitor, HttpClient, NewFileRecord, Orchestrator,
    PipelineConfig, PublishConfig, PublishError, PublishGate, PublishReceipt, PublishRequest,
    PublishSource, Publisher, RateLimiter, RecordMetadata, RecordStore, RetryPolicy, SpaceProbe,
    TransferEngine,
};
use tempfile::TempDir;
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// One request seen by [`RangeResponder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRequest {
    pub method: String,
    pub range: Option<String>,
}

/// Shared view of the requests an origin received.
#[derive(Debug, Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<SeenRequest>>>);

impl RequestLog {
    pub fn all(&self) -> Vec<SeenRequest> {
        self.0.lock().unwrap().clone()
    }

    /// GETs that transfer content, ignoring `bytes=0-0` size probes.
    pub fn transfers(&self) -> Vec<SeenRequest> {
        self.all()
            .into_iter()
            .filter(|r| r.method == "GET" && r.range.as_deref() != Some("bytes=0-0"))
            .collect()
    }

    pub(crate) fn push(&self, request: SeenRequest) {
        self.0.lock().unwrap().push(request);
    }
}

/// Origin serving one body with HEAD, full GET and `Range: bytes=N-[M]`.
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    accept_ranges: bool,
    failing_probes: bool,
    failing_transfers: AtomicUsize,
    log: RequestLog,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>, accept_ranges: bool) -> Self {
        Self {
            body: Arc::new(body),
            accept_ranges,
            failing_probes: false,
            failing_transfers: AtomicUsize::new(0),
            log: RequestLog::default(),
        }
    }

    /// HEAD and `bytes=0-0` size probes answer 503.
    pub fn with_failing_probes(mut self) -> Self {
        self.failing_probes = true;
        self
    }

    /// The next `count` content GETs answer 503.
    pub fn with_failing_transfers(self, count: usize) -> Self {
        self.failing_transfers.store(count, Ordering::SeqCst);
        self
    }

    pub fn log(&self) -> RequestLog {
        self.log.clone()
    }

    fn with_range_headers(&self, template: ResponseTemplate) -> ResponseTemplate {
        if self.accept_ranges {
            template.insert_header("accept-ranges", "bytes")
        } else {
            template
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.log.push(SeenRequest {
            method: request.method.as_str().to_string(),
            range: range.clone(),
        });

        let is_probe = request.method.as_str() == "HEAD" || range.as_deref() == Some("bytes=0-0");
        if is_probe && self.failing_probes {
            return ResponseTemplate::new(503);
        }
        if !is_probe
            && self
                .failing_transfers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return ResponseTemplate::new(503);
        }

        let total = self.body.len();
        if request.method.as_str() == "HEAD" {
            return self.with_range_headers(
                ResponseTemplate::new(200).insert_header("content-length", total.to_string()),
            );
        }

        match range.as_deref().and_then(parse_range).filter(|_| self.accept_ranges) {
            Some((start, _)) if start >= total => ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{total}")),
            Some((start, end)) => {
                let end = end.map_or(total - 1, |e| e.min(total - 1));
                self.with_range_headers(
                    ResponseTemplate::new(206)
                        .insert_header("content-range", format!("bytes {start}-{end}/{total}"))
                        .set_body_bytes(self.body[start..=end].to_vec()),
                )
            }
            None => self.with_range_headers(
                ResponseTemplate::new(200).set_body_bytes(self.body.as_ref().clone()),
            ),
        }
    }
}

pub(crate) fn parse_range(value: &str) -> Option<(usize, Option<usize>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        e => Some(e.parse().ok()?),
    };
    Some((start, end))
}

/// What a [`RecordingPublisher`] received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub file_name: String,
    pub caption: String,
    pub destination: String,
    pub bytes: u64,
    pub streamed: bool,
}

/// Publisher that records every call and the peak number of overlapping calls.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Published>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_id: AtomicI64,
    hold: Duration,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps each call open for `hold` so overlaps become observable.
    pub fn with_hold(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn receive(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        let (bytes, streamed) = match request.source {
            PublishSource::File(path) => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| PublishError::Permanent(e.to_string()))?;
                (meta.len(), false)
            }
            PublishSource::Stream { mut body, .. } => {
                let mut bytes = 0u64;
                while let Some(chunk) = body.next().await {
                    let chunk = chunk.map_err(|e| PublishError::Transient(e.to_string()))?;
                    bytes += chunk.len() as u64;
                }
                (bytes, true)
            }
        };
        tokio::time::sleep(self.hold).await;

        self.published.lock().unwrap().push(Published {
            file_name: request.file_name,
            caption: request.caption,
            destination: request.destination,
            bytes,
            streamed,
        });
        Ok(PublishReceipt {
            message_id: Some(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
        })
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.receive(request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Free space fixed by the test, adjustable while a run is in progress.
#[derive(Debug)]
pub struct FixedSpace(AtomicU64);

impl FixedSpace {
    pub fn new(bytes: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(bytes)))
    }

    pub fn plenty() -> Arc<Self> {
        Self::new(u64::MAX / 2)
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

/// A disk of `capacity` bytes whose only contents are the files under `root`.
#[derive(Debug)]
pub struct SimulatedDisk {
    capacity: u64,
    root: PathBuf,
}

impl SimulatedDisk {
    pub fn new(capacity: u64, root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            root: root.into(),
        })
    }
}

impl SpaceProbe for SimulatedDisk {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.capacity.saturating_sub(used_bytes(&self.root)))
    }
}

fn used_bytes(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => used_bytes(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

/// Store, download directory and recording publisher in one temp directory.
pub struct Harness {
    _dir: TempDir,
    pub download_dir: PathBuf,
    pub store: RecordStore,
    pub publisher: Arc<RecordingPublisher>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_publisher(RecordingPublisher::new()).await
    }

    pub async fn with_publisher(publisher: RecordingPublisher) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("relay.db")).await.unwrap();
        Self {
            download_dir: dir.path().join("media"),
            _dir: dir,
            store: RecordStore::new(db),
            publisher: Arc::new(publisher),
        }
    }

    /// Fast-polling configuration that never waits for space by default.
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            download_dir: self.download_dir.clone(),
            download_attempts: 2,
            disk: DiskSpaceConfig {
                min_free_bytes: 1_000,
                critical_free_bytes: 100,
                poll_interval: Duration::from_millis(20),
                cache_ttl: Duration::ZERO,
                space_wait: Duration::ZERO,
                ..DiskSpaceConfig::default()
            },
            publish: PublishConfig {
                destination: "@relay_test".to_string(),
                attempt_timeout: Duration::from_secs(10),
                max_attempts: 2,
                ..PublishConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    pub fn orchestrator(&self, config: PipelineConfig, space: Arc<dyn SpaceProbe>) -> Orchestrator {
        let publisher: Arc<dyn Publisher> = self.publisher.clone();
        self.orchestrator_with(config, space, publisher)
    }

    /// Same wiring with another publisher behind the gate.
    pub fn orchestrator_with(
        &self,
        config: PipelineConfig,
        space: Arc<dyn SpaceProbe>,
        publisher: Arc<dyn Publisher>,
    ) -> Orchestrator {
        let engine = TransferEngine::new(
            HttpClient::new().unwrap(),
            fast_policy(config.download_attempts),
            Arc::new(RateLimiter::disabled()),
        );
        let gate = PublishGate::with_policy(
            publisher,
            config.publish.attempt_timeout,
            fast_policy(config.publish.max_attempts),
        );
        let monitor = DiskSpaceMonitor::with_probe(&config.download_dir, &config.disk, space);
        Orchestrator::new(
            self.store.clone(),
            Arc::new(engine),
            Arc::new(gate),
            Arc::new(monitor),
            config,
        )
    }

    /// Tracks one record and returns its id.
    pub async fn add(
        &self,
        collection: &str,
        page: &str,
        url: &str,
        size_hint: Option<u64>,
    ) -> i64 {
        self.store
            .insert(
                collection,
                &NewFileRecord {
                    page: page.to_string(),
                    url: Some(url.to_string()),
                    size_hint,
                    metadata: RecordMetadata {
                        title: Some(format!("Clip {page}")),
                        ..RecordMetadata::default()
                    },
                },
            )
            .await
            .unwrap()
            .unwrap()
    }
}

pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(10),
        Duration::from_millis(20),
        2.0,
    )
    .without_jitter()
}
