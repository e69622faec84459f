//! The relay: a durable event queue wired to a flush controller.
//!
//! [`Relay`] is the object producers hold. Capturing an event is
//! synchronous and never fails loudly; delivery happens in the background
//! on the caller's Tokio runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{ClientError, EventClient, Transport};
use crate::config::{Config, ConfigError};
use crate::connectivity::{ConnectivityError, ConnectivityMonitor, Reachability};
use crate::controller::{FlushController, FlushOutcome, FlushStats};
use crate::event::Event;
use crate::queue::{EventQueue, QueueStats};
use crate::store::StoreError;

/// Property holding the capture time in epoch milliseconds.
pub const CLIENT_TS_PROPERTY: &str = "client_ts";

/// Property holding the unique id assigned at capture.
pub const CLIENT_EVENT_ID_PROPERTY: &str = "client_event_id";

/// Errors that can occur while setting up a relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open event queue: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to create HTTP client: {0}")]
    Client(#[from] ClientError),

    #[error("Invalid collector address: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("A Tokio runtime is required: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// Snapshot of relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Records currently queued
    pub queue_depth: usize,

    /// Flushing is paused by a connectivity loss
    pub paused: bool,

    /// Delivery failures since the last success
    pub consecutive_failures: u32,

    pub queue: QueueStats,
    pub flush: FlushStats,
}

/// Captures events into a durable queue and delivers them in batches.
pub struct Relay {
    queue: Arc<EventQueue>,
    controller: FlushController,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Relay {
    /// Set up a relay delivering over HTTP, with a connectivity probe
    /// against the collector host.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn setup(config: &Config) -> Result<Self, RelayError> {
        config.validate()?;
        Handle::try_current()?;

        let client = EventClient::new(config)?;
        let monitor = ConnectivityMonitor::from_url(
            &config.api_url,
            config.reachability_interval,
            config.request_timeout.min(config.reachability_interval),
        )?;

        let relay = Self::build(config, Arc::new(client))?;
        let (rx, handle) = monitor.spawn();
        relay.controller.start(Some(rx));
        *relay.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(relay)
    }

    /// Set up a relay with a custom transport and an optional
    /// reachability feed.
    pub fn with_transport(
        config: &Config,
        transport: Arc<dyn Transport>,
        reachability: Option<watch::Receiver<Reachability>>,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        let relay = Self::build(config, transport)?;
        relay.controller.start(reachability);
        Ok(relay)
    }

    fn build(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, RelayError> {
        let queue = Arc::new(EventQueue::open(&config.storage_dir, config.queue_config())?);
        let controller = FlushController::new(Arc::clone(&queue), transport, config.flush_config())?;

        info!(
            storage_dir = %config.storage_dir.display(),
            queued = queue.len(),
            flush_at = config.flush_at,
            max_queue_size = config.max_queue_size,
            "Event relay ready"
        );

        Ok(Self {
            queue,
            controller,
            monitor: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Capture a named event.
    ///
    /// Stamps the event with its capture time and a unique id. Returns
    /// whether the event was stored.
    pub fn capture(&self, name: impl Into<String>, properties: HashMap<String, String>) -> bool {
        let event = Event::new(name)
            .with_data(properties)
            .with_property(CLIENT_TS_PROPERTY, Utc::now().timestamp_millis().to_string())
            .with_property(CLIENT_EVENT_ID_PROPERTY, format!("EI-{}", Uuid::new_v4()));
        self.capture_event(&event)
    }

    /// Queue an event as is.
    pub fn capture_event(&self, event: &Event) -> bool {
        if self.closed.load(Ordering::Acquire) {
            debug!(event = %event.name, "Relay closed, dropping event");
            return false;
        }
        self.queue.add(event)
    }

    /// Request a background flush. Returns `false` when gated or closed.
    pub fn flush(&self) -> bool {
        self.controller.flush()
    }

    /// Flush and wait for the outcome. A closed relay skips the flush.
    pub async fn flush_now(&self) -> FlushOutcome {
        self.controller.flush_now().await
    }

    /// Drop every queued event.
    pub fn clear(&self) {
        self.queue.clear();
    }

    /// Number of events waiting for delivery.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Get current relay statistics.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            queue_depth: self.queue.len(),
            paused: self.controller.is_paused(),
            consecutive_failures: self.controller.consecutive_failures(),
            queue: self.queue.stats(),
            flush: self.controller.stats(),
        }
    }

    /// The controller driving delivery.
    pub fn controller(&self) -> &FlushController {
        &self.controller
    }

    /// Stop background work. Queued events stay on disk for the next run;
    /// there is no final flush.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown();
        info!(queued = self.queue.len(), "Event relay closed");
    }

    fn shutdown(&self) {
        self.controller.shutdown();
        if let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}
