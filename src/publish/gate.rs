//! Single-flight publish wrapper with deadlines, cooldowns and retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{PublishError, PublishReceipt, PublishRequest, Publisher};
use crate::config::PublishConfig;
use crate::download::{RetryDecision, RetryPolicy};

/// Serializes publish calls and applies the retry policy.
///
/// Only one publish runs at a time per gate; the lock is held across
/// cooldowns and backoff so that a channel-wide rate limit is respected by
/// every consumer sharing the gate.
pub struct PublishGate {
    publisher: Arc<dyn Publisher>,
    in_flight: Mutex<()>,
    attempt_timeout: Duration,
    policy: RetryPolicy,
}

impl std::fmt::Debug for PublishGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishGate")
            .field("attempt_timeout", &self.attempt_timeout)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PublishGate {
    /// Wraps `publisher` using the timeout and attempt count from `config`.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, config: &PublishConfig) -> Self {
        Self::with_policy(
            publisher,
            config.attempt_timeout,
            RetryPolicy::with_max_attempts(config.max_attempts),
        )
    }

    /// Wraps `publisher` with an explicit deadline and retry policy.
    #[must_use]
    pub fn with_policy(
        publisher: Arc<dyn Publisher>,
        attempt_timeout: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            publisher,
            in_flight: Mutex::new(()),
            attempt_timeout,
            policy,
        }
    }

    /// Publishes with retries for file sources and a single attempt for streams.
    ///
    /// # Errors
    ///
    /// Returns the last [`PublishError`] once it is permanent or attempts run out.
    #[instrument(skip_all, fields(file = %request.file_name))]
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        let _guard = self.in_flight.lock().await;
        let mut attempt = 0u32;
        let mut pending = Some(request);

        loop {
            attempt += 1;
            let Some(current) = pending.take() else {
                return Err(PublishError::Permanent("publish request consumed".into()));
            };
            let retry_copy = current.try_clone();

            let error = match self.attempt(current).await {
                Ok(receipt) => {
                    info!(attempt, message_id = ?receipt.message_id, "published");
                    return Ok(receipt);
                }
                Err(error) => error,
            };

            let Some(next) = retry_copy else {
                debug!("stream source cannot be replayed, not retrying");
                return Err(error);
            };

            match self.policy.should_retry(error.failure_type(), attempt) {
                RetryDecision::Retry {
                    delay: backoff,
                    attempt: next_attempt,
                } => {
                    let delay = match &error {
                        PublishError::RateLimited { retry_after } => *retry_after,
                        _ => backoff,
                    };
                    warn!(
                        attempt = next_attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying publish"
                    );
                    tokio::time::sleep(delay).await;
                    pending = Some(next);
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(%reason, "not retrying publish");
                    return Err(error);
                }
            }
        }
    }

    async fn attempt(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        match tokio::time::timeout(self.attempt_timeout, self.publisher.publish(request)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Transient(format!(
                "publish timed out after {}s",
                self.attempt_timeout.as_secs()
            ))),
        }
    }
}
