//! Network reachability probe.
//!
//! [`ConnectivityMonitor`] periodically opens a TCP connection to the
//! collector and publishes [`Reachability`] transitions on a `watch`
//! channel. The flush controller subscribes to that channel to pause and
//! resume delivery.

use std::fmt;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Whether the collector can currently be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Reachable => write!(f, "reachable"),
            Reachability::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Errors building a monitor from a collector URL.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("Invalid collector URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Collector URL '{0}' has no host or port")]
    MissingAddress(String),
}

/// Periodic TCP reachability probe for one host and port.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    host: String,
    port: u16,
    interval: Duration,
    timeout: Duration,
}

impl ConnectivityMonitor {
    pub fn new(host: impl Into<String>, port: u16, interval: Duration, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            interval,
            timeout,
        }
    }

    /// Probe the host and port of a collector URL.
    ///
    /// The port falls back to the scheme default (80 for http, 443 for https).
    pub fn from_url(url: &str, interval: Duration, timeout: Duration) -> Result<Self, ConnectivityError> {
        let parsed = Url::parse(url).map_err(|e| ConnectivityError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ConnectivityError::MissingAddress(url.to_string()))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ConnectivityError::MissingAddress(url.to_string()))?;

        // IPv6 literals come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, port, interval, timeout))
    }

    /// `host:port` being probed.
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Open and drop one TCP connection.
    pub async fn probe(&self) -> Reachability {
        match timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(_)) => Reachability::Reachable,
            Ok(Err(e)) => {
                debug!(target_addr = %self.target(), error = %e, "Connectivity probe failed");
                Reachability::Unreachable
            }
            Err(_) => {
                debug!(target_addr = %self.target(), "Connectivity probe timed out");
                Reachability::Unreachable
            }
        }
    }

    /// Start probing in the background.
    ///
    /// The channel starts as `Reachable` and only carries transitions. The
    /// task ends once every receiver is dropped.
    pub fn spawn(self) -> (watch::Receiver<Reachability>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(Reachability::Reachable);
        let handle = tokio::spawn(self.run(tx));
        (rx, handle)
    }

    async fn run(self, tx: watch::Sender<Reachability>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            target_addr = %self.target(),
            interval_secs = self.interval.as_secs_f64(),
            "Connectivity monitor started"
        );

        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }

            let current = self.probe().await;
            let changed = tx.send_if_modified(|state| {
                if *state == current {
                    false
                } else {
                    *state = current;
                    true
                }
            });

            if changed {
                match current {
                    Reachability::Reachable => info!(target_addr = %self.target(), "Collector reachable"),
                    Reachability::Unreachable => warn!(target_addr = %self.target(), "Collector unreachable"),
                }
            }
        }

        debug!("Connectivity monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const FAST: Duration = Duration::from_millis(20);
    const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn test_from_url_uses_explicit_port() {
        let monitor = ConnectivityMonitor::from_url("http://localhost:8080/v1", FAST, PROBE_TIMEOUT).unwrap();
        assert_eq!(monitor.target(), "localhost:8080");
    }

    #[test]
    fn test_from_url_uses_scheme_default_port() {
        let monitor = ConnectivityMonitor::from_url("https://collector.example.com", FAST, PROBE_TIMEOUT).unwrap();
        assert_eq!(monitor.target(), "collector.example.com:443");

        let monitor = ConnectivityMonitor::from_url("http://[::1]/", FAST, PROBE_TIMEOUT).unwrap();
        assert_eq!(monitor.target(), "[::1]:80");
    }

    #[test]
    fn test_from_url_rejects_garbage() {
        let err = ConnectivityMonitor::from_url("not a url", FAST, PROBE_TIMEOUT).unwrap_err();
        assert!(matches!(err, ConnectivityError::InvalidUrl { .. }));
    }

    #[test]
    fn test_reachability_display() {
        assert_eq!(Reachability::Reachable.to_string(), "reachable");
        assert_eq!(Reachability::Unreachable.to_string(), "unreachable");
    }

    #[tokio::test]
    async fn test_probe_open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let monitor = ConnectivityMonitor::new("127.0.0.1", port, FAST, PROBE_TIMEOUT);
        assert_eq!(monitor.probe().await, Reachability::Reachable);
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_unreachable() {
        let port = closed_port().await;
        let monitor = ConnectivityMonitor::new("127.0.0.1", port, FAST, PROBE_TIMEOUT);
        assert_eq!(monitor.probe().await, Reachability::Unreachable);
    }

    #[tokio::test]
    async fn test_spawn_publishes_transition() {
        let port = closed_port().await;
        let monitor = ConnectivityMonitor::new("127.0.0.1", port, FAST, PROBE_TIMEOUT);

        let (mut rx, handle) = monitor.spawn();
        assert_eq!(*rx.borrow(), Reachability::Reachable);

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("no transition published")
            .unwrap();
        assert_eq!(*rx.borrow(), Reachability::Unreachable);

        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
