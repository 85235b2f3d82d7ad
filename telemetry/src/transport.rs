//! Batch delivery to the collector.
//!
//! The dispatcher only knows the [`Transport`] trait: hand over an ordered
//! batch, learn whether it was accepted. Two implementations ship with the
//! crate:
//!
//! - [`HttpTransport`]: `POST {collector}/interactions/batch` with a bearer
//!   token, using a pooled reqwest client
//! - [`MemoryTransport`]: records batches in memory, optionally failing,
//!   for dry runs and tests
//!
//! Delivery is at-least-once. A send that the collector accepted but that
//! looked failed to us (timeout after commit) will be retried, so receivers
//! must tolerate duplicate batches.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use studytrail_telemetry::context::SharedTokenStore;
//! use studytrail_telemetry::transport::{HttpTransport, Transport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let tokens = Arc::new(SharedTokenStore::with_token("session-token"));
//!     let transport = HttpTransport::new("https://collector.example.com", tokens).unwrap();
//!
//!     transport.send(&[]).await.unwrap();
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::context::TokenStore;
use crate::types::InteractionEvent;

/// Path of the batch endpoint, relative to the collector URL.
pub const BATCH_PATH: &str = "/interactions/batch";

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Retry delay assumed when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Errors that can occur while delivering a batch.
#[derive(Error, Debug)]
pub enum TransportError {
    /// HTTP request failed (connection, timeout, TLS).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Collector returned an error status.
    #[error("server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Collector rejected the bearer token (401).
    #[error("authentication failed: collector rejected the token")]
    AuthFailed,

    /// Rate limited (429).
    #[error("rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// The token disappeared between the auth check and the send.
    #[error("no authentication token available")]
    MissingToken,

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Token contains characters that are not valid in a header.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// Simulated outage from [`MemoryTransport`].
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Delay requested by the collector before the next attempt, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

/// Delivers ordered batches of events.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one batch. The batch is never empty when called by the
    /// dispatcher, and its order must be preserved on the wire.
    async fn send(&self, events: &[InteractionEvent]) -> Result<(), TransportError>;
}

#[derive(Serialize)]
struct BatchBody<'a> {
    events: &'a [InteractionEvent],
}

/// Bearer-authenticated HTTP transport.
pub struct HttpTransport {
    url: String,
    client: Client,
    tokens: Arc<dyn TokenStore>,
}

impl HttpTransport {
    /// Creates a transport posting to `{collector_url}/interactions/batch`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Http` if the HTTP client cannot be built.
    pub fn new(collector_url: &str, tokens: Arc<dyn TokenStore>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            url: format!("{}{BATCH_PATH}", collector_url.trim_end_matches('/')),
            client,
            tokens,
        })
    }

    /// Full URL of the batch endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.url
    }

    fn headers(&self) -> Result<HeaderMap, TransportError> {
        let token = self.tokens.token().ok_or(TransportError::MissingToken)?;
        let bearer = Zeroizing::new(format!("Bearer {}", token.as_str()));

        let mut authorization = HeaderValue::from_str(&bearer)?;
        authorization.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(AUTHORIZATION, authorization);
        Ok(headers)
    }

    /// Parses the Retry-After header from a 429 response.
    fn parse_retry_after(response: &reqwest::Response) -> u64 {
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, events: &[InteractionEvent]) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&BatchBody { events })?;
        let headers = self.headers()?;

        debug!(url = %self.url, events = events.len(), "Sending interaction batch");

        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        match status {
            _ if status.is_success() => {
                info!(events = events.len(), "Interaction batch accepted");
                Ok(())
            }
            StatusCode::UNAUTHORIZED => {
                error!("Collector rejected authentication token");
                Err(TransportError::AuthFailed)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = Self::parse_retry_after(&response);
                warn!(retry_after_secs, "Rate limited by collector");
                Err(TransportError::RateLimited { retry_after_secs })
            }
            _ => {
                let message = response.text().await.unwrap_or_default();
                Err(TransportError::Server {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

/// In-memory transport that records every accepted batch.
///
/// Used by the CLI `--dry-run` mode and by tests. It can be switched into a
/// failing state to simulate an outage.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    batches: Mutex<Vec<Vec<InteractionEvent>>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
    attempted: Notify,
}

impl MemoryTransport {
    /// Creates a transport that accepts every batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that rejects every batch.
    #[must_use]
    pub fn failing() -> Self {
        let transport = Self::new();
        transport.set_failing(true);
        transport
    }

    /// Switches the simulated outage on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Batches accepted so far, in delivery order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<InteractionEvent>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of send attempts, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` send attempts have been made.
    pub async fn wait_for_attempts(&self, count: usize) {
        loop {
            let attempted = self.attempted.notified();
            if self.attempts() >= count {
                return;
            }
            attempted.await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, events: &[InteractionEvent]) -> Result<(), TransportError> {
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(TransportError::Unavailable("simulated outage".to_string()))
        } else {
            self.batches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(events.to_vec());
            Ok(())
        };

        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempted.notify_waiters();
        result
    }
}
