//! Disk space monitor: admission decisions, bounded waits and stale-file eviction.
//!
//! Free space is read through a [`SpaceProbe`] and cached for a few seconds,
//! since producers ask before every download and the answer rarely changes
//! between two adjacent records. Any operation that frees or fills space
//! should call [`DiskSpaceMonitor::invalidate`].
//!
//! A probe error never blocks the pipeline: it is logged and treated as
//! "enough space".

mod probe;

pub use probe::{SpaceProbe, StatvfsProbe, get_available_space};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::DiskSpaceConfig;

/// Watches free space under the managed download directory.
#[derive(Debug)]
pub struct DiskSpaceMonitor {
    root: PathBuf,
    min_free: u64,
    critical_free: u64,
    poll_interval: Duration,
    cache_ttl: Duration,
    space_wait: Duration,
    stale_file_age: Duration,
    probe: Arc<dyn SpaceProbe>,
    cache: Mutex<Option<(Instant, u64)>>,
    protected: Vec<PathBuf>,
}

impl DiskSpaceMonitor {
    /// Creates a monitor for `root` using the real filesystem probe.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: &DiskSpaceConfig) -> Self {
        Self::with_probe(root, config, Arc::new(StatvfsProbe))
    }

    /// Creates a monitor with a custom probe.
    #[must_use]
    pub fn with_probe(
        root: impl Into<PathBuf>,
        config: &DiskSpaceConfig,
        probe: Arc<dyn SpaceProbe>,
    ) -> Self {
        Self {
            root: root.into(),
            min_free: config.min_free_bytes,
            critical_free: config.critical_free_bytes,
            poll_interval: config.poll_interval,
            cache_ttl: config.cache_ttl,
            space_wait: config.space_wait,
            stale_file_age: config.stale_file_age,
            probe,
            cache: Mutex::new(None),
            protected: Vec::new(),
        }
    }

    /// Excludes a path from [`Self::reclaim_stale_files`].
    ///
    /// SQLite's `-wal`, `-shm` and `-journal` companions of the path are
    /// excluded with it.
    #[must_use]
    pub fn protect(mut self, path: impl Into<PathBuf>) -> Self {
        self.protected.push(path.into());
        self
    }

    /// Forgets the cached reading so the next query hits the filesystem.
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Current free bytes, `None` when the probe fails.
    pub fn free_bytes(&self) -> Option<u64> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((at, bytes)) = *cache
            && at.elapsed() < self.cache_ttl
        {
            return Some(bytes);
        }

        let target = nearest_existing(&self.root);
        match self.probe.available_bytes(&target) {
            Ok(bytes) => {
                *cache = Some((Instant::now(), bytes));
                Some(bytes)
            }
            Err(e) => {
                warn!(
                    path = %target.display(),
                    error = %e,
                    "free space probe failed, assuming enough space"
                );
                *cache = None;
                None
            }
        }
    }

    /// Whether a download of `required` bytes keeps free space above the threshold.
    pub fn has_space_for(&self, required: u64) -> bool {
        self.free_bytes()
            .is_none_or(|free| free > self.min_free.saturating_add(required))
    }

    /// Whether free space is at or below the minimum threshold.
    pub fn is_below_threshold(&self) -> bool {
        self.free_bytes().is_some_and(|free| free <= self.min_free)
    }

    /// False only when free space is under the critical threshold.
    pub fn can_continue_publishing(&self) -> bool {
        self.free_bytes()
            .is_none_or(|free| free >= self.critical_free)
    }

    /// Polls until `required` bytes fit or `max_wait` elapses.
    ///
    /// Returns `false` when the wait timed out; the caller should skip the
    /// item for this cycle.
    #[instrument(skip(self))]
    pub async fn wait_for_space(&self, required: u64, max_wait: Duration) -> bool {
        self.wait_until(max_wait, || self.has_space_for(required)).await
    }

    /// Polls until free space is back above the critical threshold or `max_wait` elapses.
    #[instrument(skip(self))]
    pub async fn wait_for_publishing_room(&self, max_wait: Duration) -> bool {
        self.wait_until(max_wait, || self.can_continue_publishing())
            .await
    }

    /// Admission control for a transfer of `required` bytes.
    ///
    /// When space is short, stale files are reclaimed first (sparing `keep`;
    /// `None` skips reclaim entirely), then the configured wait applies.
    /// Returns `false` when the transfer should be skipped for this cycle.
    #[instrument(skip(self, keep))]
    pub async fn admit(&self, required: u64, keep: Option<&[PathBuf]>) -> bool {
        if self.has_space_for(required) {
            return true;
        }

        if let Some(keep) = keep
            && self.reclaim_stale_files(self.stale_file_age, keep).await > 0
            && self.has_space_for(required)
        {
            return true;
        }

        if self.space_wait.is_zero() {
            return false;
        }
        info!(required, wait_secs = self.space_wait.as_secs(), "waiting for disk space");
        self.wait_for_space(required, self.space_wait).await
    }

    async fn wait_until(&self, max_wait: Duration, ready: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            self.invalidate();
            if ready() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(waited_ms = max_wait.as_millis(), "gave up waiting for disk space");
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Deletes regular files under the managed directory not modified within `max_age`.
    ///
    /// Protected paths and `keep` are never touched. Returns the number of
    /// files removed.
    #[instrument(skip(self, keep), fields(root = %self.root.display(), keep = keep.len()))]
    pub async fn reclaim_stale_files(&self, max_age: Duration, keep: &[PathBuf]) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut protected = self.protected_set().await;
        for path in keep {
            protected.push(canonical_or_self(path).await);
        }
        let mut removed = 0usize;
        let mut pending = vec![canonical_or_self(&self.root).await];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() || is_protected(&protected, &path) {
                    continue;
                }

                let modified = entry
                    .metadata()
                    .await
                    .and_then(|meta| meta.modified())
                    .unwrap_or_else(|_| SystemTime::now());
                if modified > cutoff {
                    continue;
                }

                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(path = %path.display(), "removed stale file");
                        removed += 1;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "could not remove stale file");
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, "reclaimed stale files");
            self.invalidate();
        }
        removed
    }

    /// Canonical forms of every protected path and its SQLite companions.
    async fn protected_set(&self) -> Vec<PathBuf> {
        let mut set = Vec::with_capacity(self.protected.len() * (SQLITE_SIDECARS.len() + 1));
        for path in &self.protected {
            let path = canonical_or_self(path).await;
            for suffix in SQLITE_SIDECARS {
                let mut sidecar = path.clone().into_os_string();
                sidecar.push(suffix);
                set.push(PathBuf::from(sidecar));
            }
            set.push(path);
        }
        set
    }
}

const SQLITE_SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];

fn is_protected(protected: &[PathBuf], path: &Path) -> bool {
    protected.iter().any(|p| p == path)
        || path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == crate::LOCK_FILE_NAME)
}

/// Resolves `path`, or its parent when the file itself does not exist yet.
async fn canonical_or_self(path: &Path) -> PathBuf {
    if let Ok(resolved) = tokio::fs::canonicalize(path).await {
        return resolved;
    }
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return path.to_path_buf();
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    tokio::fs::canonicalize(parent)
        .await
        .map_or_else(|_| path.to_path_buf(), |dir| dir.join(name))
}

/// The path itself if it exists, otherwise its closest existing ancestor.
fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}
