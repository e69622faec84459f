//! Bounded, durable FIFO queue of events.
//!
//! Wraps the [`RecordStore`] with a capacity policy: when the queue is full
//! the oldest record is evicted to make room for the new one. Crossing the
//! `flush_at` threshold wakes the flush controller through a shared
//! [`Notify`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::store::{RecordStore, SequenceKey, StoreError};

/// Default maximum number of queued events.
const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Default queue depth that triggers an eager flush.
const DEFAULT_FLUSH_AT: usize = 20;

/// Configuration for the event queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Hard cap on queued events before the oldest is evicted
    pub max_queue_size: usize,

    /// Queue depth at which a flush is requested immediately
    pub flush_at: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            flush_at: DEFAULT_FLUSH_AT,
        }
    }
}

impl QueueConfig {
    pub fn new(max_queue_size: usize, flush_at: usize) -> Self {
        Self {
            max_queue_size,
            flush_at,
        }
    }
}

/// Statistics about queue operations.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Total number of events passed to `add`
    pub events_received: u64,

    /// Total number of events written to disk
    pub events_queued: u64,

    /// Total number of oldest events evicted on overflow
    pub events_evicted: u64,

    /// Events dropped because they could not be serialized
    pub serialization_failures: u64,

    /// Events dropped because they could not be written
    pub write_failures: u64,

    /// Stored records discarded because they could not be decoded
    pub decode_failures: u64,
}

/// Records read from the head of the queue for one delivery attempt.
///
/// The batch does not own the records; they stay on disk until the batch
/// is acknowledged.
#[derive(Debug, Default)]
pub struct Batch {
    /// Keys of every record read, including ones that failed to decode
    keys: Vec<SequenceKey>,

    /// Decoded events in queue order
    events: Vec<Event>,
}

impl Batch {
    /// Decoded events to deliver.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of records read from the queue, decodable or not.
    pub fn records_read(&self) -> usize {
        self.keys.len()
    }

    /// Number of records that were read but could not be decoded.
    pub fn discarded(&self) -> usize {
        self.keys.len() - self.events.len()
    }

    /// Check if no records were read.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

struct QueueState {
    store: RecordStore,
    stats: QueueStats,
}

/// Durable FIFO queue with drop-oldest overflow.
///
/// `add` is synchronous and only holds the internal lock around the disk
/// write; it never waits on delivery.
pub struct EventQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    flush_signal: Arc<Notify>,
}

impl EventQueue {
    /// Open a queue backed by the records in `dir`.
    pub fn open(dir: impl Into<PathBuf>, config: QueueConfig) -> Result<Self, StoreError> {
        Ok(Self::new(RecordStore::open(dir)?, config))
    }

    /// Create a queue on top of an opened store.
    pub fn new(store: RecordStore, config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                store,
                stats: QueueStats::default(),
            }),
            config,
            flush_signal: Arc::new(Notify::new()),
        }
    }

    /// Signal notified whenever the queue depth reaches `flush_at`.
    pub fn flush_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.flush_signal)
    }

    /// Queue an event.
    ///
    /// Failures are logged and the event is dropped; nothing is returned to
    /// the producer except whether the event was stored.
    pub fn add(&self, event: &Event) -> bool {
        let bytes = match event.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(event = %event.name, error = %e, "Dropping unserializable event");
                None
            }
        };

        let depth = {
            let mut state = self.lock();
            state.stats.events_received += 1;

            let Some(bytes) = bytes else {
                state.stats.serialization_failures += 1;
                return false;
            };

            while state.store.len() >= self.config.max_queue_size {
                if state.store.remove_at(0).is_none() {
                    break;
                }
                state.stats.events_evicted += 1;
                info!(
                    max_queue_size = self.config.max_queue_size,
                    "Queue is full, dropped oldest event"
                );
            }

            if state.store.append(&bytes).is_err() {
                state.stats.write_failures += 1;
                return false;
            }
            state.stats.events_queued += 1;
            state.store.len()
        };

        debug!(event = %event.name, depth = depth, "Queued event");

        if depth >= self.config.flush_at {
            self.flush_signal.notify_one();
        }
        true
    }

    /// Read up to `max` records from the head and decode them.
    ///
    /// Records that fail to decode are left out of the events but still
    /// count towards the batch, so acknowledging it removes them too.
    pub fn take(&self, max: usize) -> Batch {
        let mut state = self.lock();
        let records = state.store.read_prefix(max);

        let mut batch = Batch {
            keys: Vec::with_capacity(records.len()),
            events: Vec::with_capacity(records.len()),
        };

        for (key, bytes) in records {
            batch.keys.push(key);
            match Event::from_bytes(&bytes) {
                Ok(event) => batch.events.push(event),
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding undecodable record");
                    state.stats.decode_failures += 1;
                }
            }
        }

        batch
    }

    /// Remove the records of a delivered batch from the head.
    ///
    /// Records added after the batch was taken are kept. Returns the number
    /// of records removed.
    pub fn acknowledge(&self, batch: &Batch) -> usize {
        let Some(last) = batch.keys.last().copied() else {
            return 0;
        };

        let mut state = self.lock();
        let count = state.store.count_through(last);
        if count < batch.records_read() {
            debug!(
                read = batch.records_read(),
                still_queued = count,
                "Some batch records were evicted during delivery"
            );
        }
        state.store.remove_prefix(count)
    }

    /// Delete every queued record.
    pub fn clear(&self) {
        if let Err(e) = self.lock().store.clear() {
            warn!(error = %e, "Failed to clear event queue");
        }
    }

    /// Current number of queued records.
    pub fn len(&self) -> usize {
        self.lock().store.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get current queue statistics.
    pub fn stats(&self) -> QueueStats {
        self.lock().stats.clone()
    }

    /// Get the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
