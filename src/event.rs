//! Event records captured by the producer and the payload shipped to the collector.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single named event with string properties.
///
/// Events are immutable once created. They are serialized to JSON when
/// queued and only decoded again when a batch is about to be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event name
    pub name: String,

    /// Single-valued properties
    #[serde(default)]
    pub data: HashMap<String, String>,

    /// Multi-valued properties, values keep their order
    #[serde(default, rename = "multiData")]
    pub multi_data: HashMap<String, Vec<String>>,
}

impl Event {
    /// Create a new event with no properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: HashMap::new(),
            multi_data: HashMap::new(),
        }
    }

    /// Replace the single-valued properties.
    pub fn with_data(mut self, data: HashMap<String, String>) -> Self {
        self.data = data;
        self
    }

    /// Add one single-valued property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Add one multi-valued property.
    pub fn with_values(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.multi_data.insert(key.into(), values);
        self
    }

    /// Encode the event into the bytes stored on disk.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode an event from stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Request body posted to the collector.
#[derive(Debug, Serialize)]
pub struct EventPayload<'a> {
    /// Events in queue order
    pub events: &'a [Event],
}

impl<'a> EventPayload<'a> {
    pub fn new(events: &'a [Event]) -> Self {
        Self { events }
    }

    /// Get the number of events in the payload.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
