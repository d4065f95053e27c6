//! Relays the server's invalidation stream onto a local broker.
//!
//! The server publishes every [`Notification`] on `GET /api/events` as a
//! Server-Sent Events stream. [`RemoteEventBridge`] decodes that stream and
//! republishes each notification locally, where coordinators registered
//! with [`crate::ViewportQueryCoordinator::watch_invalidations`] pick it
//! up. Delivery is best-effort: events sent while disconnected are lost.

use std::time::Duration;

use civic_map_events::{EventBroker, Notification};
use civic_map_server_models::ApiError;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::QueryError;

/// First reconnect delay.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delays double up to this ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Incremental decoder for `text/event-stream` bodies.
///
/// Only `data` fields matter here; `event`, `id` and `retry` fields and
/// comment lines are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the payloads of every event it completed.
    ///
    /// Chunks may split lines, and even UTF-8 sequences, anywhere.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line[..end]);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            if field == "data" {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.data.push(value.to_string());
            }
        }

        events
    }
}

/// Subscribes to a remote notification stream and republishes it.
pub struct RemoteEventBridge {
    client: reqwest::Client,
    url: String,
    broker: EventBroker,
}

impl RemoteEventBridge {
    /// Creates a bridge from `url` (e.g. `http://localhost:8080/api/events`)
    /// to `broker`.
    #[must_use]
    pub fn new(url: impl Into<String>, broker: EventBroker) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            broker,
        }
    }

    /// Connects once and relays until the stream ends or `shutdown` fires.
    ///
    /// Returns how many notifications were relayed.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] if the connection cannot be established, the
    /// server rejects it, or the stream breaks.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<usize, QueryError> {
        let resp = self
            .client
            .get(&self.url)
            .header("accept", "text/event-stream")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await?;
            let err: ApiError = serde_json::from_str(&body)
                .unwrap_or_else(|_| ApiError::new(format!("HTTP {status}: {body}")));
            return Err(QueryError::Status {
                status: status.as_u16(),
                message: err.error,
                details: err.details,
            });
        }

        log::info!("Connected to event stream at {}", self.url);

        let mut stream = std::pin::pin!(resp.bytes_stream());
        let mut decoder = SseDecoder::new();
        let mut relayed = 0;

        loop {
            let chunk = tokio::select! {
                () = shutdown.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };

            for payload in decoder.push(&chunk?) {
                if self.relay(&payload) {
                    relayed += 1;
                }
            }
        }

        Ok(relayed)
    }

    /// Keeps [`Self::run`] going with exponential backoff between attempts
    /// until `shutdown` fires.
    pub async fn run_with_reconnect(&self, shutdown: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;

        while !shutdown.is_cancelled() {
            match self.run(&shutdown).await {
                Ok(relayed) => {
                    log::info!("Event stream closed after {relayed} notifications");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    log::warn!(
                        "Event stream error: {e}, reconnecting in {}s",
                        backoff.as_secs()
                    );
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        log::debug!("Event bridge to {} stopped", self.url);
    }

    fn relay(&self, payload: &str) -> bool {
        match serde_json::from_str::<Notification>(payload) {
            Ok(notification) => {
                self.broker.publish(&notification);
                true
            }
            Err(e) => {
                log::warn!("Skipping malformed notification: {e}");
                false
            }
        }
    }
}
