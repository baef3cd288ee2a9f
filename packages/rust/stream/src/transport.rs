//! The HTTP seam: opening one subscription to the event feed.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::header::{ACCEPT, HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use streamrouter_shared::{RouterError, StreamConfig};

use crate::sse::{self, SseFrame};

/// Frames of one live subscription. Dropping it closes the connection.
pub type FrameStream = BoxStream<'static, Result<SseFrame, StreamError>>;

/// Why opening or reading a subscription stopped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// HTTP 429.
    #[error("too many requests")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other non-success status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// Request could not be sent (DNS, TCP, TLS, timeout).
    #[error("connect failed: {0}")]
    Connect(String),

    /// An established stream was cut off.
    #[error("stream disconnected: {0}")]
    Disconnected(String),

    /// The request itself is malformed; retrying will not help.
    #[error("invalid subscription request: {0}")]
    InvalidRequest(String),
}

impl From<StreamError> for RouterError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::RateLimited { retry_after } => RouterError::RateLimited { retry_after },
            StreamError::InvalidRequest(msg) => RouterError::config(msg),
            other => RouterError::Network(other.to_string()),
        }
    }
}

/// Parameters of one subscription attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// ISO-8601 value of the `since` query parameter.
    pub since: String,
    /// SSE id to continue from after a dropped connection.
    pub last_event_id: Option<String>,
}

/// Opens subscriptions. Implemented over HTTP by [`HttpTransport`]; tests
/// substitute scripted transports.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &SubscribeRequest) -> Result<FrameStream, StreamError>;
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// `reqwest`-backed long-lived streaming GET.
pub struct HttpTransport {
    client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(config: &StreamConfig) -> streamrouter_shared::Result<Self> {
        let base = Url::parse(&config.url).map_err(|e| {
            RouterError::config(format!("invalid stream url '{}': {e}", config.url))
        })?;

        // No overall timeout: the response body is meant to stay open.
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| RouterError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base })
    }

    fn url_for(&self, request: &SubscribeRequest) -> Url {
        let mut url = self.base.clone();
        url.query_pairs_mut().append_pair("since", &request.since);
        url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &SubscribeRequest) -> Result<FrameStream, StreamError> {
        let url = self.url_for(request);
        debug!(%url, last_event_id = ?request.last_event_id, "opening subscription");

        let mut req = self.client.get(url).header(ACCEPT, "text/event-stream");
        if let Some(id) = &request.last_event_id {
            req = req.header("Last-Event-ID", id.as_str());
        }

        let response = req.send().await.map_err(|e| {
            if e.is_builder() {
                StreamError::InvalidRequest(e.to_string())
            } else {
                StreamError::Connect(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(StreamError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            return Err(StreamError::Status(status.as_u16()));
        }

        Ok(sse::frames(response.bytes_stream()))
    }
}

/// `Retry-After` in its delta-seconds form; HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
