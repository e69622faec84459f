//! Event Relay Library
//!
//! A durable, bounded, on-disk event queue with a flush controller that
//! delivers batches to a remote collector:
//!
//! - **store**: One file per record, ordered by monotonic sequence keys
//! - **queue**: Bounded FIFO of events with oldest-first eviction
//! - **event**: Event records and the wire payload
//! - **client**: Delivery transport trait and its HTTP implementation
//! - **controller**: Single-flight flushing with pause and linear backoff
//! - **connectivity**: TCP reachability probe feeding pause/resume
//! - **relay**: Producer-facing façade wiring everything together
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//!
//! use event_relay::config::Config;
//! use event_relay::relay::Relay;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let relay = Relay::setup(&config).expect("Failed to set up relay");
//!
//!     let mut properties = HashMap::new();
//!     properties.insert("screen".to_string(), "home".to_string());
//!     relay.capture("Screen Viewed", properties);
//!
//!     relay.flush_now().await;
//!     relay.close();
//! }
//! ```

pub mod client;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod event;
pub mod queue;
pub mod relay;
pub mod store;

pub use client::{ClientError, ClientStats, EventClient, Transport};
pub use config::{Config, ConfigError};
pub use connectivity::{ConnectivityError, ConnectivityMonitor, Reachability};
pub use controller::{FlushConfig, FlushController, FlushOutcome, FlushStats, SkipReason};
pub use event::{Event, EventPayload};
pub use queue::{Batch, EventQueue, QueueConfig, QueueStats};
pub use relay::{Relay, RelayError, RelayStats};
pub use store::{RecordStore, SequenceKey, StoreError};
