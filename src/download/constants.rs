//! Constants for the transfer engine (timeouts, buffers, politeness).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-read idle timeout (5 minutes, large media files stall on slow origins).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Write buffer used while streaming a body to disk (256 KiB).
pub const CHUNK_BUFFER_BYTES: usize = 256 * 1024;

/// Absolute slack allowed between the written size and the announced size
/// before a completed transfer is reported as mismatched.
pub const SIZE_SLACK_BYTES: u64 = 1024 * 1024;

/// Warning threshold for cumulative rate limit delay per origin (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value honoured (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
