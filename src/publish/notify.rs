//! Fire-and-forget progress notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PublishError;

/// How long a detached notification may take before it is abandoned.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives human-readable status messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one message.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] when delivery fails; callers only log it.
    async fn notify(&self, message: &str) -> Result<(), PublishError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<(), PublishError> {
        info!(target: "media_relay::notify", "{message}");
        Ok(())
    }
}

/// Sends `message` on a background task without waiting for it.
///
/// Failures and timeouts are logged; they never reach the caller. The handle
/// lets a caller that is about to exit wait for delivery.
pub fn notify_detached(notifier: Arc<dyn Notifier>, message: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(&message)).await {
            Ok(Ok(())) => debug!("notification delivered"),
            Ok(Err(error)) => warn!(error = %error, "notification failed"),
            Err(_) => warn!(
                timeout_secs = NOTIFY_TIMEOUT.as_secs(),
                "notification timed out"
            ),
        }
    })
}
