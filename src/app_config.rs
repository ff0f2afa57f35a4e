//! Application configuration loading and CLI merging.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use media_relay::config::MAX_CONCURRENCY;
use media_relay::{PipelineConfig, RunMode};

/// TOML-backed file configuration; every field is optional and CLI flags win.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// SQLite database file.
    pub database: Option<PathBuf>,
    /// Root directory for downloaded files.
    pub download_dir: Option<PathBuf>,
    /// Default execution mode.
    pub mode: Option<RunMode>,
    /// Concurrent downloads.
    pub download_concurrency: Option<usize>,
    /// Publish workers; 0 downloads only.
    pub upload_concurrency: Option<usize>,
    /// Producer-to-consumer queue capacity.
    pub queue_capacity: Option<usize>,
    /// Attempts per download within one run.
    pub download_attempts: Option<u32>,
    /// Deadline for one download attempt.
    pub download_timeout_secs: Option<u64>,
    /// Delay between requests to one origin.
    pub rate_limit_ms: Option<u64>,
    /// Failed runs after which a record is no longer retried; 0 disables.
    pub max_record_attempts: Option<u32>,
    /// Keep at least this much free after a download.
    pub min_free_bytes: Option<u64>,
    /// Below this, publishing pauses too.
    pub critical_free_bytes: Option<u64>,
    /// Longest wait for disk space.
    pub space_wait_secs: Option<u64>,
    /// Age after which idle files may be evicted.
    pub stale_file_age_secs: Option<u64>,
    /// Remove local files after publishing.
    pub delete_after_publish: Option<bool>,
    /// Publish a mismatched local file as-is when space is critical.
    pub publish_partial_on_low_space: Option<bool>,
    /// Channel or chat to publish to.
    pub chat_id: Option<String>,
    /// Chat receiving progress messages.
    pub notify_chat_id: Option<String>,
    /// Bot API endpoint, for self-hosted servers.
    pub bot_api_url: Option<String>,
    /// Deadline for one publish attempt.
    pub publish_timeout_secs: Option<u64>,
    /// Attempts per publish.
    pub publish_attempts: Option<u32>,
    /// Caption character limit.
    pub caption_limit: Option<usize>,
}

impl FileConfig {
    /// Validates values that the TOML types alone cannot restrict.
    pub fn validate(&self) -> Result<()> {
        if let Some(value) = self.download_concurrency
            && !(1..=MAX_CONCURRENCY).contains(&value)
        {
            bail!(
                "Invalid config value for `download_concurrency`: {value}. Expected range: 1..={MAX_CONCURRENCY}"
            );
        }
        if let Some(value) = self.upload_concurrency
            && value > MAX_CONCURRENCY
        {
            bail!(
                "Invalid config value for `upload_concurrency`: {value}. Expected range: 0..={MAX_CONCURRENCY}"
            );
        }
        if let Some(value) = self.rate_limit_ms
            && value > 60_000
        {
            bail!("Invalid config value for `rate_limit_ms`: {value}. Expected range: 0..=60000");
        }
        validate_positive("download_timeout_secs", self.download_timeout_secs)?;
        validate_positive("publish_timeout_secs", self.publish_timeout_secs)?;
        validate_positive("queue_capacity", self.queue_capacity.map(|v| v as u64))?;
        validate_positive("download_attempts", self.download_attempts.map(u64::from))?;
        validate_positive("publish_attempts", self.publish_attempts.map(u64::from))?;
        if let (Some(critical), Some(min)) = (self.critical_free_bytes, self.min_free_bytes)
            && critical > min
        {
            bail!("`critical_free_bytes` ({critical}) must not exceed `min_free_bytes` ({min})");
        }
        Ok(())
    }

    /// Copies every set value onto `config`.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(dir) = &self.download_dir {
            config.download_dir.clone_from(dir);
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(value) = self.download_concurrency {
            config.download_concurrency = value;
        }
        if let Some(value) = self.upload_concurrency {
            config.upload_concurrency = value;
        }
        if let Some(value) = self.queue_capacity {
            config.queue_capacity = value;
        }
        if let Some(value) = self.download_attempts {
            config.download_attempts = value;
        }
        if let Some(secs) = self.download_timeout_secs {
            config.download_deadline = Some(Duration::from_secs(secs));
        }
        if let Some(value) = self.rate_limit_ms {
            config.origin_interval_ms = value;
        }
        if let Some(value) = self.min_free_bytes {
            config.disk.min_free_bytes = value;
        }
        if let Some(value) = self.critical_free_bytes {
            config.disk.critical_free_bytes = value;
        }
        if let Some(secs) = self.space_wait_secs {
            config.disk.space_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = self.stale_file_age_secs {
            config.disk.stale_file_age = Duration::from_secs(secs);
        }
        if let Some(value) = self.delete_after_publish {
            config.delete_after_publish = value;
        }
        if let Some(value) = self.publish_partial_on_low_space {
            config.publish_partial_on_low_space = value;
        }
        if let Some(chat) = &self.chat_id {
            config.publish.destination.clone_from(chat);
        }
        if let Some(secs) = self.publish_timeout_secs {
            config.publish.attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = self.publish_attempts {
            config.publish.max_attempts = value;
        }
        if let Some(value) = self.caption_limit {
            config.publish.caption_limit = value;
        }
    }
}

fn validate_positive(field: &str, value: Option<u64>) -> Result<()> {
    if value == Some(0) {
        bail!("Invalid config value for `{field}`: 0. Expected a positive value");
    }
    Ok(())
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/media-relay/config.toml`
/// 2. `$HOME/.config/media-relay/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("media-relay")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("media-relay")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file.
///
/// An explicit path must exist; the default path is optional.
pub fn load_file_config(explicit: Option<&Path>) -> Result<Option<FileConfig>> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match resolve_default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        },
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    let config = parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
    Ok(Some(config))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}
