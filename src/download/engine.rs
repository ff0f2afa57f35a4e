//! Transfer engine: resumable downloads with retry and backoff.
//!
//! Wraps [`HttpClient::fetch`] in the retry loop: every attempt is spaced by
//! the per-origin [`RateLimiter`], optionally bounded by a deadline, and
//! classified on failure. Interrupted connections keep their partial file so
//! the next attempt resumes with a `Range` request; every other failure
//! discards it.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use media_relay::download::{HttpClient, RateLimiter, RetryPolicy, TransferEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = TransferEngine::new(
//!     HttpClient::new()?,
//!     RetryPolicy::default(),
//!     Arc::new(RateLimiter::disabled()),
//! );
//! let outcome = engine
//!     .download("https://cdn.example.com/a.mp4", Path::new("/srv/media/site/a_1.mp4"))
//!     .await?;
//! println!("{} bytes, resumed: {}", outcome.bytes_on_disk, outcome.resumed);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::client::{FetchReport, HttpClient, RemoteProbe};
use super::constants::SIZE_SLACK_BYTES;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::DownloadError;

/// A completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Where the file now lives.
    pub path: PathBuf,
    /// Final size on disk.
    pub bytes_on_disk: u64,
    /// Size the origin announced, when it did.
    pub expected_bytes: Option<u64>,
    /// Bytes received across all attempts.
    pub bytes_transferred: u64,
    /// Whether any attempt appended to an existing prefix.
    pub resumed: bool,
    /// Whether the file was already complete before the first attempt.
    pub already_complete: bool,
    /// Attempts used (1-indexed).
    pub attempts: u32,
}

/// A transfer that exhausted its retries or failed permanently.
#[derive(Debug, Error)]
#[error("transfer failed after {attempts} attempt(s): {source}")]
pub struct TransferFailure {
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Classification of the last error.
    pub failure: FailureType,
    /// The last error.
    #[source]
    pub source: DownloadError,
}

/// Retrying download driver shared by all producers.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    client: HttpClient,
    policy: RetryPolicy,
    limiter: Arc<RateLimiter>,
    attempt_deadline: Option<Duration>,
}

impl TransferEngine {
    /// Creates an engine with no per-attempt deadline.
    #[must_use]
    pub fn new(client: HttpClient, policy: RetryPolicy, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            policy,
            limiter,
            attempt_deadline: None,
        }
    }

    /// Bounds every attempt (probe plus body) by `deadline`; `None` means unbounded.
    #[must_use]
    pub fn with_attempt_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.attempt_deadline = deadline;
        self
    }

    /// Probes remote size and range support, respecting origin spacing.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when neither HEAD nor a ranged GET succeed.
    pub async fn probe(&self, url: &str) -> Result<RemoteProbe, DownloadError> {
        self.limiter.acquire(url).await;
        self.client.probe(url).await
    }

    /// Opens a plain GET for streaming, respecting origin spacing.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for invalid URLs, network failures and bad statuses.
    pub async fn open(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        self.limiter.acquire(url).await;
        self.client.open(url).await
    }

    /// Downloads `url` to `destination`, resuming any prefix already there.
    ///
    /// # Errors
    ///
    /// Returns [`TransferFailure`] once the error is permanent or retries run out.
    #[instrument(skip(self, destination), fields(dest = %destination.display()))]
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<TransferOutcome, TransferFailure> {
        let mut attempt = 0u32;
        let mut transferred = 0u64;
        let mut resumed = false;

        loop {
            attempt += 1;
            debug!(attempt, "starting transfer attempt");
            self.limiter.acquire(url).await;

            match self.attempt(url, destination).await {
                Ok(report) => {
                    transferred += report.bytes_transferred;
                    resumed |= report.resumed;
                    verify_announced_size(url, &report);
                    info!(
                        bytes = report.bytes_on_disk,
                        resumed,
                        already_complete = report.already_complete,
                        attempts = attempt,
                        "transfer complete"
                    );
                    return Ok(TransferOutcome {
                        path: destination.to_path_buf(),
                        bytes_on_disk: report.bytes_on_disk,
                        expected_bytes: report.expected_total,
                        bytes_transferred: transferred,
                        resumed,
                        already_complete: report.already_complete && attempt == 1,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    if !error.keeps_partial() {
                        discard_partial(destination).await;
                    }

                    let failure = classify_error(&error);
                    let retry_after = if failure == FailureType::RateLimited {
                        self.server_cooldown(url, &error).await
                    } else {
                        None
                    };

                    match self.policy.should_retry(failure, attempt) {
                        RetryDecision::Retry {
                            delay: backoff,
                            attempt: next_attempt,
                        } => {
                            let delay = retry_after.unwrap_or(backoff);
                            warn!(
                                attempt = next_attempt,
                                max_attempts = self.policy.max_attempts(),
                                delay_ms = delay.as_millis(),
                                using_retry_after = retry_after.is_some(),
                                error = %error,
                                "retrying transfer"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(%reason, "not retrying transfer");
                            return Err(TransferFailure {
                                attempts: attempt,
                                failure,
                                source: error,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn attempt(&self, url: &str, destination: &Path) -> Result<FetchReport, DownloadError> {
        let fetch = self.client.fetch(url, destination, None);
        match self.attempt_deadline {
            Some(deadline) => tokio::time::timeout(deadline, fetch)
                .await
                .unwrap_or_else(|_| Err(DownloadError::timeout(url))),
            None => fetch.await,
        }
    }

    /// Reads `Retry-After` from a 429 and tells the limiter about it.
    async fn server_cooldown(&self, url: &str, error: &DownloadError) -> Option<Duration> {
        let DownloadError::HttpStatus {
            retry_after: Some(value),
            ..
        } = error
        else {
            return None;
        };
        let delay = parse_retry_after(value)?;
        self.limiter.record_rate_limit(url, delay).await;
        Some(delay)
    }
}

/// Logs a mismatch between the written and announced size; never fatal.
fn verify_announced_size(url: &str, report: &FetchReport) {
    if let Some(expected) = report.expected_total
        && report.bytes_on_disk.abs_diff(expected) > SIZE_SLACK_BYTES
    {
        warn!(
            url,
            expected,
            actual = report.bytes_on_disk,
            "transferred size differs from announced size"
        );
    }
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "discarded partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not discard partial file"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::test_support::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, Request, Respond, ResponseTemplate};

    fn engine(max_attempts: u32) -> TransferEngine {
        TransferEngine::new(
            HttpClient::new().unwrap(),
            RetryPolicy::new(
                max_attempts,
                Duration::from_millis(10),
                Duration::from_millis(20),
                2.0,
            )
            .without_jitter(),
            Arc::new(RateLimiter::disabled()),
        )
    }

    /// Fails the first `failures` requests with `status`, then serves `body`.
    struct FlakyResponder {
        hits: Arc<AtomicUsize>,
        failures: usize,
        status: u16,
        body: Vec<u8>,
    }

    impl Respond for FlakyResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let n = self.hits.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                ResponseTemplate::new(self.status).insert_header("retry-after", "0")
            } else {
                ResponseTemplate::new(200).set_body_bytes(self.body.clone())
            }
        }
    }

    #[tokio::test]
    async fn test_download_retries_transient_status() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(FlakyResponder {
                hits: Arc::clone(&hits),
                failures: 2,
                status: 503,
                body: b"payload".to_vec(),
            })
            .mount(&mock_server)
            .await;

        let dest = temp_dir.path().join("a.mp4");
        let outcome = engine(3)
            .download(&format!("{}/a.mp4", mock_server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.bytes_on_disk, 7);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_download_honours_rate_limit_then_succeeds() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .respond_with(FlakyResponder {
                hits: Arc::new(AtomicUsize::new(0)),
                failures: 1,
                status: 429,
                body: b"ok".to_vec(),
            })
            .mount(&mock_server)
            .await;

        let dest = temp_dir.path().join("r.mp4");
        let outcome = engine(2)
            .download(&format!("{}/r.mp4", mock_server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_download_permanent_failure_discards_partial() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("gone.mp4");
        std::fs::write(&dest, b"old prefix").unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(410))
            .expect(1)
            .mount(&mock_server)
            .await;

        let failure = engine(3)
            .download(&format!("{}/gone.mp4", mock_server.uri()), &dest)
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.failure, FailureType::Permanent);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_download_invalid_url_fails_without_request() {
        let temp_dir = TempDir::new().unwrap();
        let failure = engine(3)
            .download("ftp://example.com/a.mp4", &temp_dir.path().join("x.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(failure.source, DownloadError::InvalidUrl { .. }));
    }
}
