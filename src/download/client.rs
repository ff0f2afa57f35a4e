//! HTTP client wrapper for probing and fetching remote media.
//!
//! `HttpClient` performs exactly one attempt per call; retries, spacing
//! and deadlines live in [`super::TransferEngine`].

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::{CHUNK_BUFFER_BYTES, CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;

/// User-Agent sent to origins.
pub const USER_AGENT: &str = concat!("media-relay/", env!("CARGO_PKG_VERSION"));

/// What the origin told us about a resource before transferring it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteProbe {
    /// Total size in bytes, when announced.
    pub total: Option<u64>,
    /// Whether byte-range requests are honoured.
    pub accepts_ranges: bool,
}

/// Result of one fetch attempt that reached the end of the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchReport {
    /// Size of the destination file afterwards.
    pub bytes_on_disk: u64,
    /// Bytes received in this attempt.
    pub bytes_transferred: u64,
    /// Announced total size, when known.
    pub expected_total: Option<u64>,
    /// Whether the body was appended to an existing prefix.
    pub resumed: bool,
    /// Whether the destination already held the whole file.
    pub already_complete: bool,
}

/// HTTP client for origin requests.
///
/// Create once and clone freely; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with default timeouts (30s connect, 5min read idle).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend fails to initialise.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit timeouts.
    ///
    /// `read_timeout` bounds each read, not the whole transfer, so large
    /// files are never cut off while bytes keep flowing.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend fails to initialise.
    #[instrument(level = "debug")]
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(DownloadError::ClientBuild)?;
        Ok(Self { client })
    }

    /// Discovers the remote size and range support.
    ///
    /// Sends HEAD first; when HEAD fails or omits `Content-Length`, falls back
    /// to a `Range: bytes=0-0` GET and reads the total from `Content-Range`.
    ///
    /// # Errors
    ///
    /// Returns the fallback request's error when both probes fail.
    #[instrument(skip(self))]
    pub async fn probe(&self, url: &str) -> Result<RemoteProbe, DownloadError> {
        validate_url(url)?;

        let mut accepts_ranges = false;
        match self.send_request(Method::HEAD, url, None).await {
            Ok(response) => {
                accepts_ranges = advertises_ranges(&response);
                if let Some(total) = header_content_length(&response) {
                    debug!(total, accepts_ranges, "probed with HEAD");
                    return Ok(RemoteProbe {
                        total: Some(total),
                        accepts_ranges,
                    });
                }
            }
            Err(e) => debug!(error = %e, "HEAD probe failed, trying ranged GET"),
        }

        let response = self
            .send_request(Method::GET, url, Some("bytes=0-0"))
            .await?;
        let probe = if response.status() == StatusCode::PARTIAL_CONTENT {
            RemoteProbe {
                total: content_range_total(&response),
                accepts_ranges: true,
            }
        } else {
            RemoteProbe {
                total: header_content_length(&response),
                accepts_ranges: accepts_ranges || advertises_ranges(&response),
            }
        };
        debug!(
            total = ?probe.total,
            accepts_ranges = probe.accepts_ranges,
            "probed with ranged GET"
        );
        Ok(probe)
    }

    /// Opens a plain GET for streaming consumers.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for invalid URLs, network failures and
    /// non-success statuses.
    #[instrument(skip(self))]
    pub async fn open(&self, url: &str) -> Result<Response, DownloadError> {
        validate_url(url)?;
        self.send_request(Method::GET, url, None).await
    }

    /// Fetches `url` into `destination` in a single attempt.
    ///
    /// An existing file is treated as a prefix: when it already covers the
    /// remote size nothing is transferred; when the origin accepts ranges the
    /// remainder is requested; otherwise the file is discarded first. A `200`
    /// answer to a ranged request truncates and restarts, and `416` discards
    /// the prefix and retries from zero.
    ///
    /// Partial data is left on disk when the body is interrupted; the caller
    /// decides whether to keep it.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] on invalid URL, network, status or IO failure.
    #[instrument(skip(self, destination, known), fields(dest = %destination.display()))]
    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        known: Option<RemoteProbe>,
    ) -> Result<FetchReport, DownloadError> {
        validate_url(url)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let mut existing = existing_len(destination).await;
        let mut probe = known;

        if existing > 0 {
            let remote = match probe {
                Some(p) => p,
                // The ranged GET below settles it: 206 resumes, 200 restarts.
                None => self.probe(url).await.unwrap_or_else(|e| {
                    debug!(error = %e, existing, "probe failed, attempting ranged resume");
                    RemoteProbe {
                        total: None,
                        accepts_ranges: true,
                    }
                }),
            };
            probe = Some(remote);

            if remote.total.is_some_and(|total| existing >= total) {
                debug!(existing, "destination already complete");
                return Ok(FetchReport {
                    bytes_on_disk: existing,
                    bytes_transferred: 0,
                    expected_total: remote.total,
                    resumed: false,
                    already_complete: true,
                });
            }

            if !remote.accepts_ranges {
                debug!(existing, "origin does not accept ranges, restarting");
                remove_partial(destination).await?;
                existing = 0;
            }
        }

        let range = (existing > 0).then(|| format!("bytes={existing}-"));
        let response = match self
            .send_request(Method::GET, url, range.as_deref())
            .await
        {
            Err(DownloadError::HttpStatus { status: 416, .. }) if range.is_some() => {
                warn!(existing, "range not satisfiable, discarding partial");
                remove_partial(destination).await?;
                existing = 0;
                self.send_request(Method::GET, url, None).await?
            }
            other => other?,
        };

        let resumed = existing > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        if existing > 0 && !resumed {
            debug!(status = %response.status(), "ranged request answered in full, truncating");
        }

        let expected_total = if resumed {
            content_range_total(&response)
                .or_else(|| header_content_length(&response).map(|n| existing + n))
        } else {
            header_content_length(&response)
        }
        .or_else(|| probe.and_then(|p| p.total));

        let file = if resumed {
            OpenOptions::new()
                .append(true)
                .open(destination)
                .await
                .map_err(|e| DownloadError::io(destination, e))?
        } else {
            File::create(destination)
                .await
                .map_err(|e| DownloadError::io(destination, e))?
        };

        let bytes_transferred =
            stream_to_file(file, response, url, destination).await?;
        let bytes_on_disk = if resumed {
            existing + bytes_transferred
        } else {
            bytes_transferred
        };

        Ok(FetchReport {
            bytes_on_disk,
            bytes_transferred,
            expected_total,
            resumed,
            already_complete: false,
        })
    }

    async fn send_request(
        &self,
        method: Method,
        url: &str,
        range: Option<&str>,
    ) -> Result<Response, DownloadError> {
        let mut request = self.client.request(method, url);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

/// Parses a URL and rejects anything but http/https.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidUrl`] for blank, malformed or non-HTTP URLs.
pub fn validate_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url.trim()).map_err(|_| DownloadError::invalid_url(url))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(DownloadError::invalid_url(url)),
    }
}

/// Streams the body to `file` and makes it durable, returning bytes written.
async fn stream_to_file(
    file: File,
    response: Response,
    url: &str,
    path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::with_capacity(CHUNK_BUFFER_BYTES, file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // Keep what arrived so a retry can resume from it.
                let _ = writer.flush().await;
                return Err(DownloadError::network(url, e));
            }
        };
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|e| DownloadError::io(path, e))?;
    writer
        .get_ref()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(path, e))?;

    Ok(bytes_written)
}

async fn existing_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

async fn remove_partial(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

fn advertises_ranges(response: &Response) -> bool {
    response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes"))
}

fn header_content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
}

fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range_total)
}

/// Total from a `Content-Range: bytes <start>-<end>/<total>` value.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}
