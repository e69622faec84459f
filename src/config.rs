//! Configuration module for the event relay.
//!
//! This module provides environment-based configuration for the collector
//! endpoint, the on-disk queue, and the flush schedule.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::controller::FlushConfig;
use crate::queue::QueueConfig;

/// Default collector base URL
const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Path of the event ingestion endpoint below the base URL
const INGEST_PATH: &str = "/v1/events";

/// Default directory for queued events
const DEFAULT_STORAGE_DIR: &str = ".event-relay/event-queue";

const DEFAULT_FLUSH_AT: usize = 20;
const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
const DEFAULT_MAX_BATCH_SIZE: usize = 50;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 20;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
const DEFAULT_MAX_RETRY_DELAY_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REACHABILITY_INTERVAL_SECS: u64 = 10;

/// Maximum allowed batch size per request
const MAX_BATCH_SIZE: usize = 10_000;

/// Maximum allowed queue size on disk
const MAX_QUEUE_SIZE: usize = 100_000;

/// Minimum flush interval to prevent overwhelming the collector
const MIN_FLUSH_INTERVAL_SECS: u64 = 1;

/// Maximum flush interval to ensure reasonable data freshness
const MAX_FLUSH_INTERVAL_SECS: u64 = 300;

/// Configuration for the event relay.
///
/// All settings can be configured via environment variables:
/// - `EVENT_RELAY_API_URL`: Collector base URL (default: http://localhost:8080)
/// - `EVENT_RELAY_API_KEY`: Bearer token for the collector (default: unset)
/// - `EVENT_RELAY_STORAGE_DIR`: Queue directory (default: .event-relay/event-queue)
/// - `EVENT_RELAY_FLUSH_AT`: Queue depth that triggers a flush (default: 20)
/// - `EVENT_RELAY_MAX_QUEUE_SIZE`: Events kept before dropping the oldest (default: 1000)
/// - `EVENT_RELAY_MAX_BATCH_SIZE`: Events per request (default: 50)
/// - `EVENT_RELAY_FLUSH_INTERVAL_SECS`: Seconds between timed flushes (default: 20)
/// - `EVENT_RELAY_RETRY_DELAY_SECS`: Backoff step after a failure (default: 5)
/// - `EVENT_RELAY_MAX_RETRY_DELAY_SECS`: Backoff ceiling (default: 30)
/// - `EVENT_RELAY_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
/// - `EVENT_RELAY_REACHABILITY_INTERVAL_SECS`: Connectivity probe period (default: 10)
/// - `EVENT_RELAY_RESUME_ON_REACHABLE`: Resume flushing when the network returns (default: true)
/// - `EVENT_RELAY_DEBUG`: Verbose logging (default: false)
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the collector
    pub api_url: String,

    /// Full URL of the event ingestion endpoint
    pub ingest_url: String,

    /// Bearer token sent with every request
    pub api_key: Option<String>,

    /// Directory holding the durable queue; must be stable across restarts
    pub storage_dir: PathBuf,

    /// Queue depth at which a flush is requested immediately
    pub flush_at: usize,

    /// Maximum number of queued events before the oldest is dropped
    pub max_queue_size: usize,

    /// Maximum number of events per delivery attempt
    pub max_batch_size: usize,

    /// Period of the flush timer
    pub flush_interval: Duration,

    /// Backoff added per consecutive failure
    pub retry_delay: Duration,

    /// Upper bound of the backoff
    pub max_retry_delay: Duration,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Period of the connectivity probe
    pub reachability_interval: Duration,

    /// Clear the network pause when the collector becomes reachable again
    pub resume_on_reachable: bool,

    /// Verbose logging
    pub debug: bool,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }

    fn general(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is not a valid value, is out of
    /// range, or the resulting settings are inconsistent.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use event_relay::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Collector: {}", config.ingest_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = env::var("EVENT_RELAY_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let ingest_url = format!("{}{}", api_url, INGEST_PATH);

        let api_key = env::var("EVENT_RELAY_API_KEY")
            .ok()
            .filter(|key| !key.is_empty());

        let storage_dir = env::var("EVENT_RELAY_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORAGE_DIR));

        let flush_at = parse_bounded("EVENT_RELAY_FLUSH_AT", DEFAULT_FLUSH_AT, 1, usize::MAX)?;
        let max_queue_size = parse_bounded(
            "EVENT_RELAY_MAX_QUEUE_SIZE",
            DEFAULT_MAX_QUEUE_SIZE,
            1,
            MAX_QUEUE_SIZE,
        )?;
        let max_batch_size = parse_bounded(
            "EVENT_RELAY_MAX_BATCH_SIZE",
            DEFAULT_MAX_BATCH_SIZE,
            1,
            MAX_BATCH_SIZE,
        )?;
        let flush_interval_secs = parse_bounded(
            "EVENT_RELAY_FLUSH_INTERVAL_SECS",
            DEFAULT_FLUSH_INTERVAL_SECS,
            MIN_FLUSH_INTERVAL_SECS,
            MAX_FLUSH_INTERVAL_SECS,
        )?;
        let retry_delay_secs = parse_bounded(
            "EVENT_RELAY_RETRY_DELAY_SECS",
            DEFAULT_RETRY_DELAY_SECS,
            0,
            u64::MAX,
        )?;
        let max_retry_delay_secs = parse_bounded(
            "EVENT_RELAY_MAX_RETRY_DELAY_SECS",
            DEFAULT_MAX_RETRY_DELAY_SECS,
            0,
            u64::MAX,
        )?;

        // Invalid values fall back to the defaults
        let request_timeout_secs: u64 = env::var("EVENT_RELAY_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        let reachability_interval_secs: u64 = env::var("EVENT_RELAY_REACHABILITY_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REACHABILITY_INTERVAL_SECS);

        let resume_on_reachable = parse_bool("EVENT_RELAY_RESUME_ON_REACHABLE", true)?;
        let debug = parse_bool("EVENT_RELAY_DEBUG", false)?;

        let config = Self {
            api_url,
            ingest_url,
            api_key,
            storage_dir,
            flush_at,
            max_queue_size,
            max_batch_size,
            flush_interval: Duration::from_secs(flush_interval_secs),
            retry_delay: Duration::from_secs(retry_delay_secs),
            max_retry_delay: Duration::from_secs(max_retry_delay_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            reachability_interval: Duration::from_secs(reachability_interval_secs),
            resume_on_reachable,
            debug,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check settings that depend on each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_at == 0 || self.max_queue_size == 0 || self.max_batch_size == 0 {
            return Err(ConfigError::general(
                "flush_at, max_queue_size and max_batch_size must be greater than 0",
            ));
        }

        if self.flush_at > self.max_queue_size {
            return Err(ConfigError::general(format!(
                "flush_at {} exceeds max_queue_size {}",
                self.flush_at, self.max_queue_size
            )));
        }

        if self.max_retry_delay < self.retry_delay {
            return Err(ConfigError::general(format!(
                "max_retry_delay {:?} is below retry_delay {:?}",
                self.max_retry_delay, self.retry_delay
            )));
        }

        if self.flush_interval.is_zero() {
            return Err(ConfigError::general("flush_interval must be greater than 0"));
        }

        if self.request_timeout.is_zero() || self.reachability_interval.is_zero() {
            return Err(ConfigError::general(
                "request_timeout and reachability_interval must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Settings for the event queue.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(self.max_queue_size, self.flush_at)
    }

    /// Settings for the flush controller.
    pub fn flush_config(&self) -> FlushConfig {
        FlushConfig {
            max_batch_size: self.max_batch_size,
            flush_interval: self.flush_interval,
            retry_delay: self.retry_delay,
            max_retry_delay: self.max_retry_delay,
            resume_on_reachable: self.resume_on_reachable,
        }
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ingest_url: format!("{}{}", DEFAULT_API_URL, INGEST_PATH),
            api_key: None,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            flush_at: DEFAULT_FLUSH_AT,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            max_retry_delay: Duration::from_secs(DEFAULT_MAX_RETRY_DELAY_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            reachability_interval: Duration::from_secs(DEFAULT_REACHABILITY_INTERVAL_SECS),
            resume_on_reachable: true,
            debug: false,
        }
    }
}

/// Parse a number from an environment variable, enforcing `min..=max`.
fn parse_bounded<T>(env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display,
{
    let Ok(value) = env::var(env_var) else {
        return Ok(default);
    };

    let parsed: T = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value)))?;

    if parsed < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} is below minimum ({})", parsed, min),
        ));
    }

    if parsed > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} exceeds maximum allowed ({})", parsed, max),
        ));
    }

    Ok(parsed)
}

fn parse_bool(env_var: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(env_var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::for_var(
                env_var,
                format!("'{}' is not a valid boolean", value),
            )),
        },
        Err(_) => Ok(default),
    }
}
