//! Runtime configuration for the pipeline.
//!
//! These are plain structs with sensible defaults; the binary fills them
//! from CLI flags and the TOML config file, then calls `validate()` once
//! before wiring components.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 1 GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Upper bound for either concurrency limit.
pub const MAX_CONCURRENCY: usize = 32;

/// Default publish attempt deadline (4 hours).
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

/// Caption length accepted by the channel.
pub const DEFAULT_CAPTION_LIMIT: usize = 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A concurrency limit is out of range.
    #[error("{name} must be between {min} and {MAX_CONCURRENCY}, got {value}")]
    Concurrency {
        /// Setting name.
        name: &'static str,
        /// Smallest accepted value.
        min: usize,
        /// Rejected value.
        value: usize,
    },

    /// Critical threshold is above the normal threshold.
    #[error("critical free space ({critical} bytes) must not exceed minimum free space ({min} bytes)")]
    ThresholdOrder {
        /// Critical threshold.
        critical: u64,
        /// Minimum threshold.
        min: u64,
    },

    /// A duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// A count that must be positive is zero.
    #[error("{0} must be at least 1")]
    ZeroCount(&'static str),

    /// Download directory is empty.
    #[error("download directory must not be empty")]
    EmptyDownloadDir,
}

/// How records flow through download and publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// One record at a time, download then publish, in input order.
    Sequential,
    /// Bounded download workers feeding a bounded publish queue.
    #[default]
    Parallel,
    /// Pipe the origin body straight into the publisher, never keeping the file.
    Streaming,
}

/// Free-space policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpaceConfig {
    /// Keep at least this much free after a download.
    pub min_free_bytes: u64,
    /// Below this, publishing pauses too.
    pub critical_free_bytes: u64,
    /// How often waits re-check free space.
    pub poll_interval: Duration,
    /// How long a free-space reading stays valid.
    pub cache_ttl: Duration,
    /// Longest a producer waits for space before skipping; zero skips immediately.
    pub space_wait: Duration,
    /// Files untouched for this long may be evicted under pressure.
    pub stale_file_age: Duration,
}

impl Default for DiskSpaceConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: 5 * GIB,
            critical_free_bytes: GIB,
            poll_interval: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(5),
            space_wait: Duration::from_secs(300),
            stale_file_age: Duration::from_secs(24 * 3600),
        }
    }
}

impl DiskSpaceConfig {
    /// Checks threshold ordering and intervals.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.critical_free_bytes > self.min_free_bytes {
            return Err(ConfigError::ThresholdOrder {
                critical: self.critical_free_bytes,
                min: self.min_free_bytes,
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("disk poll interval"));
        }
        Ok(())
    }
}

/// Publishing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    /// Channel or chat the files are sent to.
    pub destination: String,
    /// Deadline for one publish attempt.
    pub attempt_timeout: Duration,
    /// Attempts per file, including the first.
    pub max_attempts: u32,
    /// Caption character limit.
    pub caption_limit: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            attempt_timeout: DEFAULT_PUBLISH_TIMEOUT,
            max_attempts: 3,
            caption_limit: DEFAULT_CAPTION_LIMIT,
        }
    }
}

impl PublishConfig {
    /// Checks timeouts and counts.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("publish timeout"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroCount("publish attempts"));
        }
        if self.caption_limit == 0 {
            return Err(ConfigError::ZeroCount("caption limit"));
        }
        Ok(())
    }
}

/// Everything the orchestrator needs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Root of local storage; files land in `<download_dir>/<collection>/`.
    pub download_dir: PathBuf,
    /// Execution mode.
    pub mode: RunMode,
    /// Concurrent downloads in parallel mode.
    pub download_concurrency: usize,
    /// Publish workers in parallel mode; `0` means download only.
    pub upload_concurrency: usize,
    /// Capacity of the producer-to-consumer queue.
    pub queue_capacity: usize,
    /// Process at most this many records per run.
    pub batch_limit: Option<u32>,
    /// Deadline for one download attempt; `None` is unbounded.
    pub download_deadline: Option<Duration>,
    /// Attempts per download within one run.
    pub download_attempts: u32,
    /// Delay between requests to one origin host in milliseconds; `0` disables.
    pub origin_interval_ms: u64,
    /// Remove the local file once it is published.
    pub delete_after_publish: bool,
    /// Publish an existing file that fails the size check when space is critical.
    pub publish_partial_on_low_space: bool,
    /// Free-space policy.
    pub disk: DiskSpaceConfig,
    /// Publishing policy.
    pub publish: PublishConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            mode: RunMode::default(),
            download_concurrency: 2,
            upload_concurrency: 1,
            queue_capacity: 8,
            batch_limit: None,
            download_deadline: None,
            download_attempts: crate::download::DEFAULT_MAX_RETRIES,
            origin_interval_ms: 0,
            delete_after_publish: true,
            publish_partial_on_low_space: true,
            disk: DiskSpaceConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Validates the whole configuration tree.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDownloadDir);
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.download_concurrency) {
            return Err(ConfigError::Concurrency {
                name: "download concurrency",
                min: 1,
                value: self.download_concurrency,
            });
        }
        if self.upload_concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::Concurrency {
                name: "upload concurrency",
                min: 0,
                value: self.upload_concurrency,
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCount("queue capacity"));
        }
        if self.download_attempts == 0 {
            return Err(ConfigError::ZeroCount("download attempts"));
        }
        if self.download_deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ZeroDuration("download deadline"));
        }
        self.disk.validate()?;
        self.publish.validate()
    }

    /// Whether downloaded files are handed to publishers at all.
    #[must_use]
    pub fn publishes(&self) -> bool {
        self.upload_concurrency > 0
    }
}
