//! Event Relay - demo producer for the durable event queue
//!
//! Captures synthetic app events at a fixed rate, persists them on disk and
//! delivers them in batches to the collector. Queued events survive a
//! restart and are delivered on the next run.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `EVENT_RELAY_API_URL`: Collector base URL (default: http://localhost:8080)
//! - `EVENT_RELAY_API_KEY`: Bearer token for the collector (default: unset)
//! - `EVENT_RELAY_STORAGE_DIR`: Queue directory (default: .event-relay/event-queue)
//! - `EVENT_RELAY_FLUSH_AT`: Queue depth that triggers a flush (default: 20)
//! - `EVENT_RELAY_MAX_QUEUE_SIZE`: Maximum queued events (default: 1000)
//! - `EVENT_RELAY_FLUSH_INTERVAL_SECS`: Seconds between timed flushes (default: 20)
//! - `EVENT_RELAY_DEBUG`: Verbose logging (default: false)
//! - `RUST_LOG`: Logging level filter (overrides `EVENT_RELAY_DEBUG`)

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use event_relay::config::Config;
use event_relay::relay::Relay;

/// Interval between synthetic events in milliseconds
const CAPTURE_INTERVAL_MS: u64 = 500;

/// How often capture progress is reported
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

const EVENT_NAMES: &[&str] = &[
    "App Active",
    "Screen Viewed",
    "Button Tapped",
    "Search Performed",
    "Item Purchased",
];

const SCREENS: &[&str] = &["home", "search", "detail", "cart", "settings"];

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(false);
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    init_tracing(config.debug);
    info!(
        api_url = %config.api_url,
        storage_dir = %config.storage_dir.display(),
        flush_at = config.flush_at,
        flush_interval_secs = config.flush_interval.as_secs(),
        "Configuration loaded"
    );

    let relay = match Relay::setup(&config) {
        Ok(relay) => relay,
        Err(e) => {
            error!(error = %e, "Failed to set up event relay");
            std::process::exit(1);
        }
    };

    info!("Event Relay running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = run_producer(&relay) => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
    }

    let stats = relay.stats();
    relay.close();
    info!(
        queued = stats.queue_depth,
        delivered = stats.flush.events_delivered,
        evicted = stats.queue.events_evicted,
        "Event Relay stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Capture random events until cancelled.
async fn run_producer(relay: &Relay) {
    let mut ticker = interval(Duration::from_millis(CAPTURE_INTERVAL_MS));
    let mut captured: u64 = 0;
    let mut last_report = std::time::Instant::now();

    loop {
        ticker.tick().await;

        let (name, properties) = random_event();
        if relay.capture(name, properties) {
            captured += 1;
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            let stats = relay.stats();
            info!(
                captured = captured,
                queued = stats.queue_depth,
                delivered = stats.flush.events_delivered,
                paused = stats.paused,
                "Producer progress"
            );
            last_report = std::time::Instant::now();
        }
    }
}

fn random_event() -> (&'static str, HashMap<String, String>) {
    let mut rng = rand::thread_rng();
    let name = EVENT_NAMES[rng.gen_range(0..EVENT_NAMES.len())];

    let mut properties = HashMap::new();
    properties.insert(
        "screen".to_string(),
        SCREENS[rng.gen_range(0..SCREENS.len())].to_string(),
    );
    if name == "Item Purchased" {
        properties.insert("amount".to_string(), format!("{:.2}", rng.gen_range(1.0..200.0)));
    }
    (name, properties)
}
