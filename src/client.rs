//! Delivery transport for sending event batches to the collector.
//!
//! The [`Transport`] trait is the seam between the flush controller and the
//! network. [`EventClient`] is the HTTP implementation: a single pooled
//! `reqwest` client posting JSON payloads. It does not retry on its own;
//! retries and backoff belong to the flush controller.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::event::{Event, EventPayload};

/// Errors that can occur during HTTP client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Server returned an error status code
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

/// Sends an ordered batch of events to the remote collector.
///
/// Implementations must not reorder the batch. The whole batch either
/// succeeds or fails; there is no partial acknowledgement. Timeouts are the
/// implementation's responsibility and surface as errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, events: &[Event]) -> Result<(), ClientError>;
}

/// Statistics about client operations.
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    /// Total number of requests made
    pub requests: u64,

    /// Total number of batches accepted by the collector
    pub batches_sent: u64,

    /// Total number of events accepted by the collector
    pub events_sent: u64,

    /// Total number of failed requests
    pub failed_requests: u64,
}

/// HTTP transport for event batches.
///
/// # Example
///
/// ```no_run
/// use event_relay::client::{EventClient, Transport};
/// use event_relay::config::Config;
/// use event_relay::event::Event;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let client = EventClient::new(&config).expect("Failed to create client");
///
///     let events = vec![Event::new("App Active")];
///     match client.send(&events).await {
///         Ok(()) => println!("Delivered {} events", events.len()),
///         Err(e) => eprintln!("Failed to send: {}", e),
///     }
/// }
/// ```
pub struct EventClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// URL of the event ingestion endpoint
    ingest_url: String,

    /// Bearer token sent with every request
    api_key: Option<String>,

    /// Request timeout duration
    timeout: Duration,

    /// Client operation statistics
    stats: RwLock<ClientStats>,
}

impl EventClient {
    /// Create a new event client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(
            config.ingest_url.clone(),
            config.api_key.clone(),
            config.request_timeout,
        )
    }

    /// Create a new event client with custom settings.
    pub fn with_settings(
        ingest_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            ingest_url: ingest_url.into(),
            api_key,
            timeout,
            stats: RwLock::new(ClientStats::default()),
        })
    }

    /// Send a single HTTP request for the batch.
    async fn send_request(&self, events: &[Event]) -> Result<(), ClientError> {
        let mut request = self
            .client
            .post(&self.ingest_url)
            .timeout(self.timeout)
            .json(&EventPayload::new(events));

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(ClientError::Status {
                code: status,
                message,
            })
        }
    }

    fn record(&self, events: usize, result: &Result<(), ClientError>) {
        if let Ok(mut stats) = self.stats.write() {
            stats.requests += 1;
            match result {
                Ok(()) => {
                    stats.batches_sent += 1;
                    stats.events_sent += events as u64;
                }
                Err(_) => stats.failed_requests += 1,
            }
        }
    }

    /// Get current client statistics.
    pub fn stats(&self) -> ClientStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Get the configured ingest URL.
    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for EventClient {
    async fn send(&self, events: &[Event]) -> Result<(), ClientError> {
        debug!(
            batch_size = events.len(),
            url = %self.ingest_url,
            "Sending event batch"
        );

        let result = self.send_request(events).await;
        self.record(events.len(), &result);

        match &result {
            Ok(()) => debug!(batch_size = events.len(), "Event batch accepted"),
            Err(e) => warn!(error = %e, batch_size = events.len(), "Event batch rejected"),
        }
        result
    }
}
