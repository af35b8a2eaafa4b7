//! Transport to the agent backend.
//!
//! The session only needs two things from the backend: a byte stream of
//! newline-delimited JSON for a request, and a way to tell the backend to stop.
//! [`Transport`] abstracts both so sessions can run against a scripted
//! transport in tests.
//!
//! Endpoints:
//! - `POST {base}/api/stream` (NDJSON response)
//! - `POST {base}/api/sessions/{id}/interrupt`

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sage_stream_core::SessionId;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::ClientConfig;
use crate::error::{StreamError, TransportError};
use crate::protocol::{ApiErrorResponse, InterruptRequest, StreamRequest};
use crate::router::LineDecoder;

/// Raw response body, in whatever pieces the transport delivers.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Trait for backend communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a streaming request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the backend rejects it.
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, TransportError>;

    /// Ask the backend to stop the session's current request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the backend rejects it.
    async fn interrupt(&self, session_id: &SessionId, reason: &str) -> Result<(), TransportError>;
}

/// HTTP transport for the agent backend.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpTransport {
    /// Create a transport using the configured connect timeout.
    ///
    /// No overall request timeout is set; streams may run for minutes.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { client, config })
    }

    /// Create a transport with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, config: ClientConfig) -> Self {
        Self { client, config }
    }

    /// Get the base URL of the backend.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }
}

/// Turn a non-success response into `TransportError::Status`.
async fn status_error(response: reqwest::Response) -> TransportError {
    let status = response.status();
    let message = response
        .json::<ApiErrorResponse>()
        .await
        .map(|e| e.detail)
        .unwrap_or_else(|_| format!("backend returned status {status}"));
    TransportError::Status {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let url = self.config.stream_url();
        let response = self.client.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            let error = status_error(response).await;
            tracing::error!(url = %url, error = %error, "Stream request rejected");
            return Err(error);
        }

        tracing::debug!(session_id = %request.session_id, "Stream opened");
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TransportError::from))
            .boxed())
    }

    async fn interrupt(&self, session_id: &SessionId, reason: &str) -> Result<(), TransportError> {
        let url = self.config.interrupt_url(session_id);
        let body = InterruptRequest {
            message: reason.to_string(),
        };
        let response = self.client.post(&url).json(&body).send().await?;

        if response.status().is_success() {
            tracing::debug!(session_id = %session_id, "Backend acknowledged interrupt");
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }
}

// =============================================================================
// Reader task
// =============================================================================

/// Events forwarded from the reader task to the session.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete line.
    Line(String),
    /// A line that could not be decoded.
    Malformed(StreamError),
    /// The transport failed mid-stream.
    Failed(TransportError),
    /// The body ended.
    Closed,
}

/// Spawn the task that splits `stream` into lines.
///
/// Returns a handle to abort the task and a receiver for its events.
pub fn spawn_reader(stream: ByteStream, buffer: usize) -> (AbortHandle, mpsc::Receiver<TransportEvent>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let handle = tokio::spawn(stream_reader(stream, tx));
    (handle.abort_handle(), rx)
}

fn line_event(line: Result<String, StreamError>) -> TransportEvent {
    match line {
        Ok(line) => TransportEvent::Line(line),
        Err(e) => TransportEvent::Malformed(e),
    }
}

/// Task that reads the body and forwards lines.
///
/// Stops early if the session drops its receiver.
async fn stream_reader(mut stream: ByteStream, tx: mpsc::Sender<TransportEvent>) {
    let mut decoder = LineDecoder::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for line in decoder.push(&bytes) {
                    if tx.send(line_event(line)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stream read failed");
                let _ = tx.send(TransportEvent::Failed(e)).await;
                return;
            }
        }
    }

    if let Some(line) = decoder.finish() {
        if tx.send(line_event(line)).await.is_err() {
            return;
        }
    }
    let _ = tx.send(TransportEvent::Closed).await;
}
