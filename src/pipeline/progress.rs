//! Batch bookkeeping.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::publish::{Notifier, notify_detached};

/// Percentages at which a milestone notification is sent.
const MILESTONES: [u8; 4] = [25, 50, 75, 100];

/// Upper bound on waiting for outstanding notifications when a batch ends.
pub(crate) const NOTIFY_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Final state of one record within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Downloaded and, when publishing, published.
    Succeeded,
    /// Left for a later run without counting as a failure.
    Skipped,
    /// Download or publish failed.
    Failed,
}

#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    succeeded: usize,
    skipped: usize,
    failed: usize,
    announced: u8,
}

/// Shared counters for one orchestrator run.
///
/// Clones share the same counters.
#[derive(Clone)]
pub struct BatchProgress {
    label: Arc<str>,
    total: usize,
    started: Instant,
    tally: Arc<Mutex<Tally>>,
    notifier: Option<Arc<dyn Notifier>>,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl fmt::Debug for BatchProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProgress")
            .field("label", &self.label)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

impl BatchProgress {
    /// Starts tracking `total` records for the batch named `label`.
    #[must_use]
    pub fn new(label: &str, total: usize, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self {
            label: Arc::from(label),
            total,
            started: Instant::now(),
            tally: Arc::new(Mutex::new(Tally::default())),
            notifier,
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of records in the batch.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Counts one finished record and announces any milestone it crosses.
    pub fn record(&self, outcome: RecordOutcome) {
        let crossed = {
            let Ok(mut tally) = self.tally.lock() else {
                warn!("batch progress lock poisoned, dropping update");
                return;
            };
            tally.completed += 1;
            match outcome {
                RecordOutcome::Succeeded => tally.succeeded += 1,
                RecordOutcome::Skipped => tally.skipped += 1,
                RecordOutcome::Failed => tally.failed += 1,
            }
            let percent = percent_of(tally.completed, self.total);
            let crossed = MILESTONES
                .iter()
                .copied()
                .filter(|m| *m > tally.announced && *m <= percent)
                .max();
            if let Some(milestone) = crossed {
                tally.announced = milestone;
            }
            crossed.map(|m| (m, tally.completed, tally.succeeded, tally.failed))
        };

        if let Some((milestone, completed, succeeded, failed)) = crossed {
            let message = format!(
                "{}: {milestone}% ({completed}/{}) done, {succeeded} ok, {failed} failed",
                self.label, self.total
            );
            info!(milestone, completed, total = self.total, "batch milestone");
            self.send(message);
        }
    }

    fn send(&self, message: String) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let handle = notify_detached(Arc::clone(notifier), message);
        match self.in_flight.lock() {
            Ok(mut in_flight) => {
                in_flight.retain(|h| !h.is_finished());
                in_flight.push(handle);
            }
            Err(_) => warn!("notification list lock poisoned, not tracking delivery"),
        }
    }

    /// Waits up to `timeout` for every notification sent so far.
    ///
    /// Returns `false` when some were still undelivered at the deadline.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let handles = match self.in_flight.lock() {
            Ok(mut in_flight) => std::mem::take(&mut *in_flight),
            Err(_) => return false,
        };
        if handles.is_empty() {
            return true;
        }
        let pending = handles.len();
        let joined = tokio::time::timeout(timeout, async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "notification task panicked");
                }
            }
        })
        .await;
        match joined {
            Ok(()) => {
                debug!(pending, "notifications flushed");
                true
            }
            Err(_) => {
                warn!(
                    pending,
                    timeout_secs = timeout.as_secs(),
                    "gave up waiting for notifications"
                );
                false
            }
        }
    }

    /// Announces the final counts and waits for outstanding notifications.
    pub async fn finish(&self, timeout: Duration) -> BatchSummary {
        let summary = self.summary();
        if self.total > 0 {
            self.send(format!("{}: finished, {summary}", self.label));
        }
        self.flush(timeout).await;
        summary
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn summary(&self) -> BatchSummary {
        let (succeeded, skipped, failed) = self
            .tally
            .lock()
            .map(|t| (t.succeeded, t.skipped, t.failed))
            .unwrap_or_default();
        BatchSummary {
            total: self.total,
            succeeded,
            skipped,
            failed,
            elapsed: self.started.elapsed(),
        }
    }
}

fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    u8::try_from(done.min(total) * 100 / total).unwrap_or(100)
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    /// Records considered.
    pub total: usize,
    /// Records fully handled.
    pub succeeded: usize,
    /// Records left for a later run.
    pub skipped: usize,
    /// Records that failed.
    pub failed: usize,
    /// Wall time of the batch.
    pub elapsed: Duration,
}

impl BatchSummary {
    /// Records that reached a final state.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} succeeded, {} skipped, {} failed in {:.1}s",
            self.total,
            self.succeeded,
            self.skipped,
            self.failed,
            self.elapsed.as_secs_f64()
        )
    }
}
