//! Per-origin politeness for origin requests.
//!
//! Requests to the same host are spaced by a minimum interval, and a
//! server-imposed `Retry-After` pushes that host's next slot further out.
//! Different hosts never wait on each other.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use media_relay::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(250));
//! limiter.acquire("https://cdn.example.com/a.mp4").await;
//! limiter.acquire("https://cdn.example.com/b.mp4").await; // waits ~250ms
//! limiter.acquire("https://other.example.org/c.mp4").await; // immediate
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Per-origin request spacing, shared across tasks behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    disabled: bool,
    /// `Arc` lets the shard lock be released before awaiting the inner mutex.
    origins: DashMap<String, Arc<OriginSlot>>,
}

#[derive(Debug)]
struct OriginSlot {
    /// Earliest instant the next request may start; `None` before the first request.
    next_allowed: Mutex<Option<Instant>>,
    waited_ms: AtomicU64,
}

impl OriginSlot {
    fn new() -> Self {
        Self {
            next_allowed: Mutex::new(None),
            waited_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_wait(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self.waited_ms.fetch_add(delay_ms, Ordering::SeqCst) + delay_ms;
        Duration::from_millis(total)
    }
}

impl RateLimiter {
    /// Creates a limiter spacing same-origin requests by `min_interval`.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            disabled: false,
            origins: DashMap::new(),
        }
    }

    /// Creates a limiter that never waits and ignores server cooldowns.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            min_interval: Duration::ZERO,
            disabled: true,
            origins: DashMap::new(),
        }
    }

    /// Builds from a millisecond interval, `0` meaning disabled.
    #[must_use]
    pub fn from_millis(interval_ms: u64) -> Self {
        if interval_ms == 0 {
            Self::disabled()
        } else {
            Self::new(Duration::from_millis(interval_ms))
        }
    }

    /// Returns whether spacing is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the configured minimum interval.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn slot(&self, origin: &str) -> Arc<OriginSlot> {
        self.origins
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(OriginSlot::new()))
            .clone()
    }

    /// Waits until a request to the URL's origin may start, then claims the slot.
    #[instrument(skip(self), fields(origin))]
    pub async fn acquire(&self, url: &str) {
        if self.disabled {
            return;
        }

        let origin = extract_domain(url);
        tracing::Span::current().record("origin", &origin);
        let slot = self.slot(&origin);

        let mut next_allowed = slot.next_allowed.lock().await;
        if let Some(at) = *next_allowed {
            let now = Instant::now();
            if at > now {
                let delay = at - now;
                let total = slot.add_wait(delay);
                debug!(delay_ms = delay.as_millis(), "spacing origin request");
                if total >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        origin = %origin,
                        waited_secs = total.as_secs(),
                        "origin is being throttled heavily"
                    );
                }
                tokio::time::sleep_until(at).await;
            }
        }

        *next_allowed = Some(Instant::now() + self.min_interval);
    }

    /// Pushes the origin's next slot out by a server-mandated cooldown.
    #[instrument(skip(self), fields(origin))]
    pub async fn record_rate_limit(&self, url: &str, delay: Duration) {
        if self.disabled {
            return;
        }

        let origin = extract_domain(url);
        tracing::Span::current().record("origin", &origin);
        let slot = self.slot(&origin);

        let until = Instant::now() + delay.min(MAX_RETRY_AFTER);
        let mut next_allowed = slot.next_allowed.lock().await;
        if next_allowed.is_none_or(|at| at < until) {
            *next_allowed = Some(until);
        }
        debug!(delay_ms = delay.as_millis(), "recorded origin cooldown");
    }
}

/// Extracts the lowercase host from a URL, `"unknown"` when unparseable.
///
/// ```
/// use media_relay::download::extract_domain;
///
/// assert_eq!(extract_domain("https://CDN.Example.com:8443/a.mp4"), "cdn.example.com");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a `Retry-After` value (integer seconds or HTTP-date), capped at one hour.
///
/// ```
/// use std::time::Duration;
/// use media_relay::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let when = httpdate::parse_http_date(header_value).ok()?;
    let delay = when
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    if delay > MAX_RETRY_AFTER {
        warn!(
            delay_secs = delay.as_secs(),
            "Retry-After date exceeds maximum, capping at 1 hour"
        );
    }
    Some(delay.min(MAX_RETRY_AFTER))
}
