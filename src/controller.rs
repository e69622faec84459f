//! Flush controller: decides when queued events are delivered.
//!
//! A flush takes a batch from the head of the [`EventQueue`], hands it to
//! the [`Transport`], and removes the batch only once the transport reports
//! success. Flushes are triggered by a repeating timer, by the queue's
//! threshold signal, or explicitly by the caller.
//!
//! At most one flush is in flight at a time. A flush may only start when the
//! controller is idle, not paused by a connectivity loss, and not inside a
//! backoff window left by a failed delivery. Backoff is linear in the number
//! of consecutive failures and capped at `max_retry_delay`; there is no
//! retry limit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::Transport;
use crate::connectivity::Reachability;
use crate::queue::{Batch, EventQueue};

/// Default maximum number of events per delivery attempt.
const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Default period of the flush timer.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(20);

/// Default backoff step after a failed delivery.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default backoff ceiling.
const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Backoff deadline used when `now + delay` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Configuration for the flush controller.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Maximum number of records read per delivery attempt
    pub max_batch_size: usize,

    /// Period of the flush timer
    pub flush_interval: Duration,

    /// Backoff added per consecutive failure
    pub retry_delay: Duration,

    /// Upper bound of the backoff
    pub max_retry_delay: Duration,

    /// Clear the network pause when connectivity returns
    pub resume_on_reachable: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            resume_on_reachable: true,
        }
    }
}

/// Backoff after `failures` consecutive delivery failures.
///
/// `min(failures * retry_delay, max_retry_delay)`.
pub fn backoff_delay(failures: u32, retry_delay: Duration, max_retry_delay: Duration) -> Duration {
    retry_delay.saturating_mul(failures).min(max_retry_delay)
}

/// Why a flush did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The controller was shut down
    Closed,

    /// Another flush is in flight
    InFlight,

    /// Connectivity was lost
    Paused,

    /// A previous delivery failed and the backoff has not elapsed
    BackingOff { remaining: Duration },
}

/// Result of one flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The flush was gated and did nothing
    Skipped(SkipReason),

    /// The batch was accepted (or held no decodable events) and removed
    Delivered { events: usize, removed: usize },

    /// The transport failed; the records stay queued
    Failed {
        consecutive_failures: u32,
        retry_in: Duration,
    },
}

/// Statistics about flush operations.
#[derive(Debug, Clone, Default)]
pub struct FlushStats {
    /// Number of batches accepted by the transport
    pub batches_delivered: u64,

    /// Number of events accepted by the transport
    pub events_delivered: u64,

    /// Number of failed delivery attempts
    pub failed_attempts: u64,

    /// Number of flush requests that were gated
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct FlushState {
    closed: bool,
    flushing: bool,
    paused: bool,
    paused_until: Option<Instant>,
    consecutive_failures: u32,
    stats: FlushStats,
}

#[derive(Default)]
struct Tasks {
    timer: Option<JoinHandle<()>>,
    threshold: Option<JoinHandle<()>>,
    connectivity: Option<JoinHandle<()>>,
    in_flight: Option<AbortHandle>,
}

struct Inner {
    queue: Arc<EventQueue>,
    transport: Arc<dyn Transport>,
    config: FlushConfig,
    state: Mutex<FlushState>,
    tasks: Mutex<Tasks>,
    runtime: Handle,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, FlushState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_success(&self, events: usize) {
        let mut state = self.state();
        state.consecutive_failures = 0;
        if events > 0 {
            state.stats.batches_delivered += 1;
            state.stats.events_delivered += events as u64;
        }
    }

    fn record_failure(&self) -> (u32, Duration) {
        let mut state = self.state();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.stats.failed_attempts += 1;

        let delay = backoff_delay(
            state.consecutive_failures,
            self.config.retry_delay,
            self.config.max_retry_delay,
        );
        let now = Instant::now();
        let until = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        state.paused_until = Some(until);
        (state.consecutive_failures, delay)
    }
}

/// Marks a flush as in flight; dropping it returns the controller to idle,
/// including when the flush task is aborted.
struct FlightGuard {
    inner: Arc<Inner>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.state().flushing = false;
    }
}

/// Schedules and runs flushes of an [`EventQueue`] through a [`Transport`].
///
/// Cloning is cheap and every clone drives the same controller.
#[derive(Clone)]
pub struct FlushController {
    inner: Arc<Inner>,
}

impl FlushController {
    /// Create a controller bound to the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside a Tokio runtime.
    pub fn new(
        queue: Arc<EventQueue>,
        transport: Arc<dyn Transport>,
        config: FlushConfig,
    ) -> Result<Self, TryCurrentError> {
        let runtime = Handle::try_current()?;
        Ok(Self {
            inner: Arc::new(Inner {
                queue,
                transport,
                config,
                state: Mutex::new(FlushState::default()),
                tasks: Mutex::new(Tasks::default()),
                runtime,
            }),
        })
    }

    /// Arm the flush timer and listen for threshold and connectivity signals.
    ///
    /// Calling `start` on a running controller has no effect.
    pub fn start(&self, reachability: Option<watch::Receiver<Reachability>>) {
        let mut tasks = self.inner.tasks();
        if tasks.timer.is_some() {
            debug!("Flush controller already started");
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let runtime = &self.inner.runtime;

        tasks.timer = Some(runtime.spawn(run_timer(weak.clone(), self.inner.config.flush_interval)));

        if tasks.threshold.is_none() {
            tasks.threshold = Some(runtime.spawn(run_threshold(
                weak.clone(),
                self.inner.queue.flush_signal(),
            )));
        }

        if let Some(rx) = reachability {
            if let Some(previous) = tasks.connectivity.replace(runtime.spawn(run_connectivity(weak, rx))) {
                previous.abort();
            }
        }

        info!(
            flush_interval_secs = self.inner.config.flush_interval.as_secs_f64(),
            max_batch_size = self.inner.config.max_batch_size,
            "Flush controller started"
        );
    }

    /// Cancel the flush timer.
    ///
    /// Pause and backoff state are kept, and threshold-triggered flushes
    /// keep working.
    pub fn stop(&self) {
        if let Some(timer) = self.inner.tasks().timer.take() {
            timer.abort();
            info!("Flush timer stopped");
        }
    }

    /// Stop every background task and abandon the flush in flight.
    ///
    /// Records of an abandoned flush stay queued and later flushes are
    /// refused. Does not wait.
    pub fn shutdown(&self) {
        self.inner.state().closed = true;
        let mut tasks = self.inner.tasks();
        for handle in [
            tasks.timer.take(),
            tasks.threshold.take(),
            tasks.connectivity.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        if let Some(in_flight) = tasks.in_flight.take() {
            in_flight.abort();
        }
        debug!("Flush controller shut down");
    }

    /// Request a flush in the background.
    ///
    /// Returns `false` when the flush was gated (already flushing, paused,
    /// or backing off). Never blocks on delivery.
    pub fn flush(&self) -> bool {
        match self.try_begin() {
            Ok(guard) => {
                let inner = Arc::clone(&self.inner);
                // Spawn under the tasks lock so `shutdown` always sees this handle
                let mut tasks = self.inner.tasks();
                let handle = self.inner.runtime.spawn(async move {
                    deliver(inner, guard).await;
                });
                tasks.in_flight = Some(handle.abort_handle());
                true
            }
            Err(reason) => {
                debug!(reason = ?reason, "Flush skipped");
                false
            }
        }
    }

    /// Run a flush to completion on the current task.
    pub async fn flush_now(&self) -> FlushOutcome {
        match self.try_begin() {
            Ok(guard) => deliver(Arc::clone(&self.inner), guard).await,
            Err(reason) => {
                debug!(reason = ?reason, "Flush skipped");
                FlushOutcome::Skipped(reason)
            }
        }
    }

    /// Check the gates and claim the in-flight slot in one critical section.
    fn try_begin(&self) -> Result<FlightGuard, SkipReason> {
        let mut state = self.inner.state();

        let gate = if state.closed {
            Some(SkipReason::Closed)
        } else if state.flushing {
            Some(SkipReason::InFlight)
        } else if state.paused {
            Some(SkipReason::Paused)
        } else {
            match state.paused_until {
                Some(until) if until > Instant::now() => Some(SkipReason::BackingOff {
                    remaining: until - Instant::now(),
                }),
                _ => None,
            }
        };

        if let Some(reason) = gate {
            state.stats.skipped += 1;
            return Err(reason);
        }

        state.paused_until = None;
        state.flushing = true;
        Ok(FlightGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Apply a connectivity change.
    ///
    /// Losing connectivity pauses flushing. Regaining it resumes flushing
    /// only when `resume_on_reachable` is set.
    pub fn set_reachability(&self, reachability: Reachability) {
        match reachability {
            Reachability::Unreachable => self.pause(),
            Reachability::Reachable if self.inner.config.resume_on_reachable => self.resume(),
            Reachability::Reachable => {
                if self.is_paused() {
                    debug!("Network reachable, queue stays paused");
                }
            }
        }
    }

    /// Pause flushing until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        let mut state = self.inner.state();
        if !state.paused {
            state.paused = true;
            info!("Queue is paused because network is unreachable");
        }
    }

    /// Clear the network pause. Backoff from failures still applies.
    pub fn resume(&self) {
        let mut state = self.inner.state();
        if state.paused {
            state.paused = false;
            info!("Queue resumed, network is reachable");
        }
    }

    /// Check if a flush is in flight.
    pub fn is_flushing(&self) -> bool {
        self.inner.state().flushing
    }

    /// Check if flushing is paused by a connectivity loss.
    pub fn is_paused(&self) -> bool {
        self.inner.state().paused
    }

    /// Number of delivery failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.state().consecutive_failures
    }

    /// Time left before a new flush may start after a failure.
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let state = self.inner.state();
        state
            .paused_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Get current flush statistics.
    pub fn stats(&self) -> FlushStats {
        self.inner.state().stats.clone()
    }

    /// Get the controller configuration.
    pub fn config(&self) -> &FlushConfig {
        &self.inner.config
    }

    /// Queue drained by this controller.
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.inner.queue
    }
}

/// Take a batch, send it, and acknowledge or back off.
async fn deliver(inner: Arc<Inner>, guard: FlightGuard) -> FlushOutcome {
    let queue = Arc::clone(&inner.queue);
    let max_batch_size = inner.config.max_batch_size;

    let batch = match tokio::task::spawn_blocking(move || queue.take(max_batch_size)).await {
        Ok(batch) => batch,
        Err(e) => {
            error!(error = %e, "Reading batch from queue failed");
            let (consecutive_failures, retry_in) = inner.record_failure();
            drop(guard);
            return FlushOutcome::Failed {
                consecutive_failures,
                retry_in,
            };
        }
    };

    let outcome = if batch.events().is_empty() {
        // Nothing decodable to send; drop whatever was read
        let removed = acknowledge(&inner, batch).await;
        if removed > 0 {
            debug!(removed = removed, "Removed undecodable records");
        }
        inner.record_success(0);
        FlushOutcome::Delivered { events: 0, removed }
    } else {
        let events = batch.events().len();
        debug!(batch_size = events, "Sending batch of events");

        match inner.transport.send(batch.events()).await {
            Ok(()) => {
                let removed = acknowledge(&inner, batch).await;
                inner.record_success(events);
                info!(events = events, removed = removed, "Delivered event batch");
                FlushOutcome::Delivered { events, removed }
            }
            Err(e) => {
                let (consecutive_failures, retry_in) = inner.record_failure();
                warn!(
                    error = %e,
                    consecutive_failures = consecutive_failures,
                    retry_in_secs = retry_in.as_secs_f64(),
                    "Delivery failed, pausing queue consumption"
                );
                FlushOutcome::Failed {
                    consecutive_failures,
                    retry_in,
                }
            }
        }
    };

    drop(guard);
    outcome
}

async fn acknowledge(inner: &Arc<Inner>, batch: Batch) -> usize {
    let queue = Arc::clone(&inner.queue);
    match tokio::task::spawn_blocking(move || queue.acknowledge(&batch)).await {
        Ok(removed) => removed,
        Err(e) => {
            error!(error = %e, "Removing delivered batch failed");
            0
        }
    }
}

async fn run_timer(inner: Weak<Inner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let controller = FlushController { inner };
        if !controller.is_flushing() {
            debug!("Flush timer fired");
            controller.flush();
        }
    }
}

async fn run_threshold(inner: Weak<Inner>, signal: Arc<Notify>) {
    loop {
        signal.notified().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        debug!("Queue reached flush threshold");
        FlushController { inner }.flush();
    }
}

async fn run_connectivity(inner: Weak<Inner>, mut rx: watch::Receiver<Reachability>) {
    // Only a starting outage matters; a starting `Reachable` must not
    // clear a pause set by the caller
    let mut reachability = *rx.borrow_and_update();
    let mut apply = reachability == Reachability::Unreachable;

    loop {
        if apply {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            FlushController { inner }.set_reachability(reachability);
        }

        if rx.changed().await.is_err() {
            debug!("Connectivity monitor closed");
            break;
        }
        reachability = *rx.borrow_and_update();
        apply = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::event::Event;
    use crate::queue::QueueConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Records every batch and fails while `fail` is set.
    #[derive(Default)]
    struct RecordingTransport {
        fail: AtomicBool,
        sent: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingTransport {
        fn failing() -> Self {
            let transport = Self::default();
            transport.fail.store(true, Ordering::SeqCst);
            transport
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, events: &[Event]) -> Result<(), ClientError> {
            self.sent
                .lock()
                .unwrap()
                .push(events.iter().map(|e| e.name.clone()).collect());
            if self.fail.load(Ordering::SeqCst) {
                Err(ClientError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    /// Holds every send until released.
    #[derive(Default)]
    struct BlockingTransport {
        entered: Notify,
        release: Notify,
        sent: Mutex<VecDeque<usize>>,
    }

    #[async_trait]
    impl Transport for BlockingTransport {
        async fn send(&self, events: &[Event]) -> Result<(), ClientError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.sent.lock().unwrap().push_back(events.len());
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        queue: Arc<EventQueue>,
        controller: FlushController,
    }

    fn fixture(
        queue_config: QueueConfig,
        flush_config: FlushConfig,
        transport: Arc<dyn Transport>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(EventQueue::open(dir.path(), queue_config).unwrap());
        let controller =
            FlushController::new(Arc::clone(&queue), transport, flush_config).unwrap();
        Fixture {
            dir,
            queue,
            controller,
        }
    }

    fn fill(queue: &EventQueue, range: std::ops::Range<usize>) {
        for i in range {
            queue.add(&Event::new(format!("event-{i}")));
        }
    }

    fn names(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("event-{i}")).collect()
    }

    fn no_backoff() -> FlushConfig {
        FlushConfig {
            retry_delay: Duration::ZERO,
            max_retry_delay: Duration::ZERO,
            ..FlushConfig::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_backoff_schedule_is_linear_and_capped() {
        let step = Duration::from_secs(5);
        let cap = Duration::from_secs(30);

        assert_eq!(backoff_delay(1, step, cap), Duration::from_secs(5));
        assert_eq!(backoff_delay(2, step, cap), Duration::from_secs(10));
        assert_eq!(backoff_delay(3, step, cap), Duration::from_secs(15));
        assert_eq!(backoff_delay(6, step, cap), Duration::from_secs(30));
        assert_eq!(backoff_delay(7, step, cap), Duration::from_secs(30));
        assert_eq!(backoff_delay(u32::MAX, step, cap), Duration::from_secs(30));
    }

    #[test]
    fn test_new_requires_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(EventQueue::open(dir.path(), QueueConfig::default()).unwrap());
        let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::default());
        assert!(FlushController::new(queue, transport, FlushConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order_and_removes_batch() {
        let transport = Arc::new(RecordingTransport::default());
        let f = fixture(QueueConfig::new(100, 50), FlushConfig::default(), transport.clone());
        fill(&f.queue, 0..3);

        let outcome = f.controller.flush_now().await;
        assert_eq!(outcome, FlushOutcome::Delivered { events: 3, removed: 3 });
        assert_eq!(transport.batches(), vec![names(0..3)]);
        assert!(f.queue.is_empty());
        assert!(!f.controller.is_flushing());
        assert_eq!(f.controller.stats().events_delivered, 3);
    }

    #[tokio::test]
    async fn test_flush_respects_max_batch_size() {
        let transport = Arc::new(RecordingTransport::default());
        let config = FlushConfig {
            max_batch_size: 2,
            ..FlushConfig::default()
        };
        let f = fixture(QueueConfig::new(100, 50), config, transport.clone());
        fill(&f.queue, 0..5);

        f.controller.flush_now().await;
        f.controller.flush_now().await;
        f.controller.flush_now().await;

        assert_eq!(
            transport.batches(),
            vec![names(0..2), names(2..4), names(4..5)]
        );
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_records_and_backs_off() {
        let transport = Arc::new(RecordingTransport::failing());
        let f = fixture(QueueConfig::new(100, 50), FlushConfig::default(), transport.clone());
        fill(&f.queue, 0..3);

        let outcome = f.controller.flush_now().await;
        assert_eq!(
            outcome,
            FlushOutcome::Failed {
                consecutive_failures: 1,
                retry_in: Duration::from_secs(5),
            }
        );
        assert_eq!(f.queue.len(), 3);
        assert_eq!(f.controller.consecutive_failures(), 1);
        assert!(f.controller.backoff_remaining().is_some());

        let outcome = f.controller.flush_now().await;
        assert!(matches!(
            outcome,
            FlushOutcome::Skipped(SkipReason::BackingOff { .. })
        ));
        assert_eq!(transport.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_huge_backoff_does_not_overflow() {
        let transport = Arc::new(RecordingTransport::failing());
        let config = FlushConfig {
            retry_delay: Duration::from_secs(u64::MAX),
            max_retry_delay: Duration::from_secs(u64::MAX),
            ..FlushConfig::default()
        };
        let f = fixture(QueueConfig::default(), config, transport.clone());
        fill(&f.queue, 0..1);

        let outcome = f.controller.flush_now().await;
        assert_eq!(
            outcome,
            FlushOutcome::Failed {
                consecutive_failures: 1,
                retry_in: Duration::from_secs(u64::MAX),
            }
        );
        assert_eq!(f.queue.len(), 1);
        assert!(matches!(
            f.controller.flush_now().await,
            FlushOutcome::Skipped(SkipReason::BackingOff { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_later_flushes() {
        let transport = Arc::new(RecordingTransport::default());
        let f = fixture(QueueConfig::default(), FlushConfig::default(), transport.clone());
        fill(&f.queue, 0..2);

        f.controller.shutdown();
        assert!(!f.controller.flush());
        assert_eq!(
            f.controller.flush_now().await,
            FlushOutcome::Skipped(SkipReason::Closed)
        );
        assert!(transport.batches().is_empty());
        assert_eq!(f.queue.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_aborts_latest_background_flush() {
        let transport = Arc::new(BlockingTransport::default());
        let f = fixture(QueueConfig::new(100, 50), no_backoff(), transport.clone());
        fill(&f.queue, 0..3);

        // Let several background flushes complete so handles are replaced
        for _ in 0..20 {
            if f.controller.flush() {
                transport.entered.notified().await;
                transport.release.notify_one();
                let controller = f.controller.clone();
                wait_until(|| !controller.is_flushing()).await;
            }
            fill(&f.queue, 0..1);
        }

        assert!(f.controller.flush());
        transport.entered.notified().await;
        let delivered = transport.sent.lock().unwrap().len();

        f.controller.shutdown();
        let controller = f.controller.clone();
        wait_until(|| !controller.is_flushing()).await;

        transport.release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), delivered);
    }

    #[tokio::test]
    async fn test_retry_offers_same_head_and_success_resets_failures() {
        let transport = Arc::new(RecordingTransport::failing());
        let f = fixture(QueueConfig::new(100, 50), no_backoff(), transport.clone());
        fill(&f.queue, 0..2);

        f.controller.flush_now().await;
        f.controller.flush_now().await;
        assert_eq!(f.controller.consecutive_failures(), 2);

        fill(&f.queue, 2..3);
        transport.fail.store(false, Ordering::SeqCst);
        let outcome = f.controller.flush_now().await;
        assert_eq!(outcome, FlushOutcome::Delivered { events: 3, removed: 3 });

        let batches = transport.batches();
        assert_eq!(batches[0], names(0..2));
        assert_eq!(batches[1], names(0..2));
        assert_eq!(batches[2], names(0..3));
        assert_eq!(f.controller.consecutive_failures(), 0);
        assert_eq!(f.controller.stats().failed_attempts, 2);
    }

    #[tokio::test]
    async fn test_empty_queue_flush_is_a_success() {
        let transport = Arc::new(RecordingTransport::default());
        let f = fixture(QueueConfig::default(), FlushConfig::default(), transport.clone());

        let outcome = f.controller.flush_now().await;
        assert_eq!(outcome, FlushOutcome::Delivered { events: 0, removed: 0 });
        assert!(transport.batches().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_records_do_not_stall_the_queue() {
        let transport = Arc::new(RecordingTransport::default());
        let f = fixture(QueueConfig::default(), FlushConfig::default(), transport.clone());
        fill(&f.queue, 0..1);

        let dir = f.dir.path();
        for entry in fs::read_dir(dir).unwrap() {
            fs::write(entry.unwrap().path(), b"not an event").unwrap();
        }

        let outcome = f.controller.flush_now().await;
        assert_eq!(outcome, FlushOutcome::Delivered { events: 0, removed: 1 });
        assert!(f.queue.is_empty());
        assert!(transport.batches().is_empty());
    }

    #[tokio::test]
    async fn test_pause_gates_every_flush() {
        let transport = Arc::new(RecordingTransport::default());
        let f = fixture(QueueConfig::new(5, 2), FlushConfig::default(), transport.clone());
        f.controller.start(None);
        f.controller.pause();

        fill(&f.queue, 0..8);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            f.controller.flush_now().await,
            FlushOutcome::Skipped(SkipReason::Paused)
        );
        assert!(!f.controller.flush());
        assert_eq!(f.queue.len(), 5);
        assert!(transport.batches().is_empty());

        f.controller.resume();
        assert_eq!(
            f.controller.flush_now().await,
            FlushOutcome::Delivered { events: 5, removed: 5 }
        );
        assert_eq!(transport.batches(), vec![names(3..8)]);
        f.controller.shutdown();
    }

    #[tokio::test]
    async fn test_reachability_pause_and_resume() {
        let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::default());
        let f = fixture(QueueConfig::default(), FlushConfig::default(), transport);

        f.controller.set_reachability(Reachability::Unreachable);
        assert!(f.controller.is_paused());
        f.controller.set_reachability(Reachability::Reachable);
        assert!(!f.controller.is_paused());
    }

    #[tokio::test]
    async fn test_pause_is_sticky_without_resume_on_reachable() {
        let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::default());
        let config = FlushConfig {
            resume_on_reachable: false,
            ..FlushConfig::default()
        };
        let f = fixture(QueueConfig::default(), config, transport);

        f.controller.set_reachability(Reachability::Unreachable);
        f.controller.set_reachability(Reachability::Reachable);
        assert!(f.controller.is_paused());
    }

    #[tokio::test]
    async fn test_connectivity_feed_drives_pause_state() {
        let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::default());
        let f = fixture(QueueConfig::default(), FlushConfig::default(), transport);
        let (tx, rx) = watch::channel(Reachability::Reachable);
        f.controller.start(Some(rx));

        tx.send(Reachability::Unreachable).unwrap();
        let controller = f.controller.clone();
        wait_until(|| controller.is_paused()).await;

        tx.send(Reachability::Reachable).unwrap();
        wait_until(|| !controller.is_paused()).await;
        f.controller.shutdown();
    }

    #[tokio::test]
    async fn test_single_flight_and_records_added_during_send_survive() {
        let transport = Arc::new(BlockingTransport::default());
        let f = fixture(QueueConfig::new(100, 50), FlushConfig::default(), transport.clone());
        fill(&f.queue, 0..3);

        assert!(f.controller.flush());
        transport.entered.notified().await;

        assert!(f.controller.is_flushing());
        assert!(!f.controller.flush());
        assert_eq!(
            f.controller.flush_now().await,
            FlushOutcome::Skipped(SkipReason::InFlight)
        );

        fill(&f.queue, 3..5);
        transport.release.notify_one();

        let controller = f.controller.clone();
        wait_until(|| !controller.is_flushing()).await;

        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(f.queue.len(), 2);
        let remaining: Vec<String> = f
            .queue
            .take(10)
            .events()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(remaining, names(3..5));
    }

    #[tokio::test]
    async fn test_timer_triggers_flush() {
        let transport = Arc::new(RecordingTransport::default());
        let config = FlushConfig {
            flush_interval: Duration::from_millis(30),
            ..FlushConfig::default()
        };
        let f = fixture(QueueConfig::new(100, 50), config, transport.clone());
        fill(&f.queue, 0..2);

        f.controller.start(None);
        let queue = Arc::clone(&f.queue);
        wait_until(|| queue.is_empty()).await;

        assert_eq!(transport.batches(), vec![names(0..2)]);
        f.controller.shutdown();
    }

    #[tokio::test]
    async fn test_threshold_triggers_flush() {
        let transport = Arc::new(RecordingTransport::default());
        let config = FlushConfig {
            flush_interval: Duration::from_secs(60),
            ..FlushConfig::default()
        };
        let f = fixture(QueueConfig::new(100, 3), config, transport.clone());
        f.controller.start(None);

        fill(&f.queue, 0..2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(transport.batches().is_empty());

        fill(&f.queue, 2..3);
        let queue = Arc::clone(&f.queue);
        wait_until(|| queue.is_empty()).await;
        assert_eq!(transport.batches(), vec![names(0..3)]);
        f.controller.shutdown();
    }

    #[tokio::test]
    async fn test_stop_keeps_backoff_state() {
        let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::failing());
        let f = fixture(QueueConfig::default(), FlushConfig::default(), transport);
        fill(&f.queue, 0..1);
        f.controller.start(None);

        f.controller.flush_now().await;
        f.controller.pause();
        f.controller.stop();

        assert_eq!(f.controller.consecutive_failures(), 1);
        assert!(f.controller.backoff_remaining().is_some());
        assert!(f.controller.is_paused());
        f.controller.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_abandons_flush_in_flight() {
        let transport = Arc::new(BlockingTransport::default());
        let f = fixture(QueueConfig::new(100, 50), FlushConfig::default(), transport.clone());
        fill(&f.queue, 0..3);

        assert!(f.controller.flush());
        transport.entered.notified().await;

        f.controller.shutdown();
        let controller = f.controller.clone();
        wait_until(|| !controller.is_flushing()).await;

        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(f.queue.len(), 3);
    }
}
