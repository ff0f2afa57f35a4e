//! Remote publish client boundary.
//!
//! The pipeline talks to the channel only through the [`Publisher`] trait.
//! [`PublishGate`] wraps any publisher with single-flight, per-attempt
//! deadlines, cooldown waits and backoff. [`BotApiPublisher`] is the
//! concrete Telegram Bot API client.

mod bot_api;
mod caption;
mod gate;
mod notify;

pub use bot_api::{BotApi, BotApiNotifier, BotApiPublisher, DEFAULT_BOT_API_URL};
pub use caption::{CaptionFormatter, DefaultCaption};
pub use gate::PublishGate;
pub use notify::{LogNotifier, Notifier, notify_detached};

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;

use crate::download::FailureType;

/// Chunked body handed to a publisher in streaming mode.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Where the bytes to publish come from.
pub enum PublishSource {
    /// A complete local file; can be re-read for retries.
    File(PathBuf),
    /// A one-shot byte stream; cannot be retried.
    Stream {
        /// Body chunks.
        body: ByteStream,
        /// Total length, when the origin announced it.
        length: Option<u64>,
    },
}

impl std::fmt::Debug for PublishSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Stream { length, .. } => f
                .debug_struct("Stream")
                .field("length", length)
                .finish_non_exhaustive(),
        }
    }
}

/// One "send this file to the channel" call.
#[derive(Debug)]
pub struct PublishRequest {
    /// Payload.
    pub source: PublishSource,
    /// Caption shown under the media.
    pub caption: String,
    /// Channel or chat identifier.
    pub destination: String,
    /// File name presented to the channel.
    pub file_name: String,
}

impl PublishRequest {
    /// Duplicates a file-backed request; streams cannot be duplicated.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match &self.source {
            PublishSource::File(path) => Some(Self {
                source: PublishSource::File(path.clone()),
                caption: self.caption.clone(),
                destination: self.destination.clone(),
                file_name: self.file_name.clone(),
            }),
            PublishSource::Stream { .. } => None,
        }
    }
}

/// Acknowledgement from the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReceipt {
    /// Message id assigned by the channel, when reported.
    pub message_id: Option<i64>,
}

/// Classified publish failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The channel imposed a cooldown.
    #[error("rate limited by channel, retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// Server-imposed wait.
        retry_after: Duration,
    },

    /// Worth retrying: network failure, server error, timeout.
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// Not worth retrying: bad request, file too large, forbidden.
    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

impl PublishError {
    /// Maps onto the shared retry classification.
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::RateLimited { .. } => FailureType::RateLimited,
            Self::Transient(_) => FailureType::Transient,
            Self::Permanent(_) => FailureType::Permanent,
        }
    }
}

/// Sends media to a remote channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one file or stream.
    ///
    /// # Errors
    ///
    /// Returns a classified [`PublishError`].
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError>;
}
