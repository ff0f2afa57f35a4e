//! Telegram Bot API client.
//!
//! Uploads go through `sendVideo` as multipart with a streamed body, so a
//! multi-gigabyte file is never held in memory. Notifications use
//! `sendMessage`. The bot token is part of every request URL, so it never
//! appears in logs or error strings: spans skip all arguments and reqwest
//! errors are stripped of their URL.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use super::{
    ByteStream, Notifier, PublishError, PublishReceipt, PublishRequest, PublishSource, Publisher,
};
use crate::download::{CHUNK_BUFFER_BYTES, USER_AGENT};

/// Public Bot API endpoint.
pub const DEFAULT_BOT_API_URL: &str = "https://api.telegram.org";

/// Cooldown assumed when a 429 carries no `retry_after`.
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Authenticated handle on the Bot API.
#[derive(Clone)]
pub struct BotApi {
    client: Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for BotApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotApi")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

impl BotApi {
    /// Creates a client for `token` against the public endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Permanent`] if the HTTP client cannot be built.
    pub fn new(token: impl Into<String>) -> Result<Self, PublishError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PublishError::Permanent(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BOT_API_URL.to_string(),
            token: token.into(),
        })
    }

    /// Points the client at another endpoint (self-hosted Bot API server, tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }

    async fn call(
        &self,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiResponse, PublishError> {
        let response = request.send().await.map_err(|e| {
            PublishError::Transient(format!("{method} request failed: {}", e.without_url()))
        })?;
        let status = response.status();
        let parsed: Option<ApiResponse> = response.json().await.ok();

        match parsed {
            Some(body) if body.ok && status.is_success() => Ok(body),
            Some(body) => Err(classify_failure(method, status, &body)),
            None if status.is_success() => Err(PublishError::Transient(format!(
                "{method} returned an unreadable body"
            ))),
            None => Err(classify_status(method, status, None, None)),
        }
    }

    /// Calls `sendVideo` with a multipart body.
    async fn send_video(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        let PublishRequest {
            source,
            caption,
            destination,
            file_name,
        } = request;

        let part = match source {
            PublishSource::File(path) => file_part(&path).await?,
            PublishSource::Stream { body, length } => stream_part(body, length),
        }
        .file_name(file_name)
        .mime_str("video/mp4")
        .map_err(|e| PublishError::Permanent(format!("invalid mime type: {e}")))?;

        let form = Form::new()
            .text("chat_id", destination)
            .text("caption", caption)
            .text("supports_streaming", "true")
            .part("video", part);

        let builder = self.client.post(self.method_url("sendVideo")).multipart(form);
        let body = self.call("sendVideo", builder).await?;
        Ok(PublishReceipt {
            message_id: body.result.map(|m| m.message_id),
        })
    }

    /// Calls `sendMessage` with a plain-text body.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), PublishError> {
        let builder = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }));
        self.call("sendMessage", builder).await.map(|_| ())
    }
}

async fn file_part(path: &Path) -> Result<Part, PublishError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| PublishError::Permanent(format!("cannot open {}: {e}", path.display())))?;
    let length = file
        .metadata()
        .await
        .map_err(|e| PublishError::Permanent(format!("cannot stat {}: {e}", path.display())))?
        .len();
    let chunks = ReaderStream::with_capacity(file, CHUNK_BUFFER_BYTES);
    Ok(stream_part(Box::pin(chunks), Some(length)))
}

fn stream_part(body: ByteStream, length: Option<u64>) -> Part {
    let body = Body::wrap_stream(body);
    match length {
        Some(length) => Part::stream_with_length(body, length),
        None => Part::stream(body),
    }
}

fn classify_failure(method: &str, status: StatusCode, body: &ApiResponse) -> PublishError {
    let code = body
        .error_code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(status);
    let retry_after = body
        .parameters
        .as_ref()
        .and_then(|p| p.retry_after)
        .map(Duration::from_secs);
    classify_status(method, code, body.description.as_deref(), retry_after)
}

fn classify_status(
    method: &str,
    status: StatusCode,
    description: Option<&str>,
    retry_after: Option<Duration>,
) -> PublishError {
    let detail = format!(
        "{method} failed with {}: {}",
        status.as_u16(),
        description.unwrap_or("no description")
    );
    if status == StatusCode::TOO_MANY_REQUESTS {
        PublishError::RateLimited {
            retry_after: retry_after.unwrap_or(FALLBACK_RETRY_AFTER),
        }
    } else if status.is_server_error() {
        PublishError::Transient(detail)
    } else {
        PublishError::Permanent(detail)
    }
}

/// Publishes videos to one chat through the Bot API.
#[derive(Debug, Clone)]
pub struct BotApiPublisher {
    api: BotApi,
}

impl BotApiPublisher {
    /// Wraps an API handle.
    #[must_use]
    pub fn new(api: BotApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Publisher for BotApiPublisher {
    #[instrument(skip_all, fields(file = %request.file_name))]
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        debug!("uploading through sendVideo");
        let result = self.api.send_video(request).await;
        if let Err(error) = &result {
            warn!(error = %error, "sendVideo failed");
        }
        result
    }
}

/// Sends status messages to a chat through the Bot API.
#[derive(Debug, Clone)]
pub struct BotApiNotifier {
    api: BotApi,
    chat_id: String,
}

impl BotApiNotifier {
    /// Notifier posting to `chat_id`.
    #[must_use]
    pub fn new(api: BotApi, chat_id: impl Into<String>) -> Self {
        Self {
            api,
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl Notifier for BotApiNotifier {
    #[instrument(skip_all)]
    async fn notify(&self, message: &str) -> Result<(), PublishError> {
        self.api.send_message(&self.chat_id, message).await
    }
}
