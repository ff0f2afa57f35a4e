//! Transfer engine for resumable media downloads.
//!
//! # Features
//!
//! - Size and range probing (HEAD, falling back to a `bytes=0-0` GET)
//! - Resume of partial files with `Range: bytes=<len>-`
//! - Streaming writes through a 256 KiB buffer, `sync_all` on completion
//! - Retry with exponential backoff and `Retry-After` support
//! - Per-origin request spacing
//! - Deterministic destination paths (`<dir>/<collection>/<title>_<id><ext>`)
//! - Size tolerance check for existing local copies ([`integrity::check_size`])

mod client;
mod constants;
mod engine;
mod error;
mod filename;
pub mod integrity;
mod rate_limiter;
mod retry;

pub use client::{FetchReport, HttpClient, RemoteProbe, USER_AGENT, validate_url};
pub use constants::CHUNK_BUFFER_BYTES;
pub use engine::{TransferEngine, TransferFailure, TransferOutcome};
pub use error::DownloadError;
pub use filename::{DEFAULT_EXTENSION, plan_path, sanitize_filename_component};
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    classify_http_status,
};

// No module-local Result alias; signatures spell out `Result<T, DownloadError>`.
