//! Durable record store backing the event queue.
//!
//! Every record is one file in the storage directory, named after its
//! [`SequenceKey`]. Order is recovered at startup by parsing and sorting
//! the file names; there is no separate index file. This is the only
//! module that touches the filesystem.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Suffix of a record that is still being written.
const TEMP_SUFFIX: &str = ".tmp";

/// Ordering key of a stored record.
///
/// Keys are the creation time in milliseconds plus a counter that breaks
/// ties between records created within the same millisecond. Keys issued
/// by one store are strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceKey {
    millis: u64,
    counter: u32,
}

impl SequenceKey {
    pub fn new(millis: u64, counter: u32) -> Self {
        Self { millis, counter }
    }

    /// Milliseconds since the Unix epoch at creation.
    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Tie-breaking counter within one millisecond.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Produce the key following `last` for a record created at `now_millis`.
    ///
    /// A clock that stalls or goes backwards never yields a key at or below `last`.
    fn next_after(last: Option<SequenceKey>, now_millis: u64) -> Self {
        match last {
            Some(last) if now_millis <= last.millis => match last.counter.checked_add(1) {
                Some(counter) => Self::new(last.millis, counter),
                None => Self::new(last.millis + 1, 0),
            },
            _ => Self::new(now_millis, 0),
        }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.counter)
    }
}

/// Error returned when a file name is not a sequence key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid sequence key '{0}'")]
pub struct ParseKeyError(String);

impl FromStr for SequenceKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseKeyError(s.to_string());
        let (millis, counter) = s.split_once('-').ok_or_else(invalid)?;
        let millis = millis.parse().map_err(|_| invalid())?;
        let counter = counter.parse().map_err(|_| invalid())?;
        Ok(Self::new(millis, counter))
    }
}

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage directory could not be created
    #[error("failed to create storage directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The storage directory could not be listed
    #[error("failed to list storage directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A record could not be written
    #[error("failed to write record {key}: {source}")]
    Write {
        key: SequenceKey,
        #[source]
        source: io::Error,
    },
}

/// Append-only, ordered, on-disk collection of opaque records.
///
/// The store is not synchronized; the owning queue serializes access.
/// A directory must be owned by exactly one store at a time.
#[derive(Debug)]
pub struct RecordStore {
    /// Directory holding one file per record
    dir: PathBuf,

    /// Keys of the records on disk, oldest first
    index: VecDeque<SequenceKey>,

    /// Highest key issued or found on disk
    last_key: Option<SequenceKey>,
}

impl RecordStore {
    /// Open the store in `dir`, creating the directory if needed.
    ///
    /// Existing records are indexed in key order. Files whose names are not
    /// sequence keys are logged and left alone. Leftovers of interrupted
    /// writes are removed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut store = Self {
            dir: dir.into(),
            index: VecDeque::new(),
            last_key: None,
        };
        store.load()?;
        Ok(store)
    }

    fn load(&mut self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::ReadDir {
            path: self.dir.clone(),
            source,
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Failed to read storage directory entry");
                    continue;
                }
            };

            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!(file = ?file_name, "Ignoring non UTF-8 entry in storage directory");
                continue;
            };

            if name.ends_with(TEMP_SUFFIX) {
                debug!(file = name, "Removing interrupted record write");
                delete_file(&entry.path());
                continue;
            }

            match name.parse::<SequenceKey>() {
                Ok(key) => keys.push(key),
                Err(e) => warn!(error = %e, "Ignoring unrecognised entry in storage directory"),
            }
        }

        keys.sort_unstable();
        self.last_key = keys.last().copied().max(self.last_key);
        self.index = keys.into();

        info!(
            dir = %self.dir.display(),
            records = self.index.len(),
            "Record store loaded"
        );
        Ok(())
    }

    /// Write a new record and append it to the index.
    ///
    /// On failure nothing is indexed and the partial file is removed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<SequenceKey, StoreError> {
        let key = SequenceKey::next_after(self.last_key, now_millis());
        self.last_key = Some(key);

        let path = self.record_path(key);
        let temp = self.dir.join(format!("{key}{TEMP_SUFFIX}"));

        if let Err(source) = write_record(&temp, &path, bytes) {
            warn!(key = %key, error = %source, "Could not write record");
            delete_file(&temp);
            return Err(StoreError::Write { key, source });
        }

        self.index.push_back(key);
        Ok(key)
    }

    /// Read up to `n` records from the head without removing them.
    ///
    /// Records whose file is missing are dropped from the index; unreadable
    /// records are deleted. Reading continues past them until `n` records
    /// are collected or the index is exhausted.
    pub fn read_prefix(&mut self, n: usize) -> Vec<(SequenceKey, Vec<u8>)> {
        let mut records = Vec::with_capacity(n.min(self.index.len()));
        let mut position = 0;

        while records.len() < n && position < self.index.len() {
            let key = self.index[position];
            let path = self.record_path(key);

            match fs::read(&path) {
                Ok(bytes) => {
                    records.push((key, bytes));
                    position += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(key = %key, "Record file does not exist, skipping");
                    self.index.remove(position);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Record file is unreadable, deleting");
                    delete_entry(&path);
                    self.index.remove(position);
                }
            }
        }

        records
    }

    /// Delete the first `n` records, oldest first.
    ///
    /// Returns the number of records actually removed.
    pub fn remove_prefix(&mut self, n: usize) -> usize {
        let mut removed = 0;
        while removed < n {
            let Some(key) = self.index.pop_front() else {
                break;
            };
            delete_file(&self.record_path(key));
            removed += 1;
        }
        removed
    }

    /// Delete the record at `position` in key order.
    pub fn remove_at(&mut self, position: usize) -> Option<SequenceKey> {
        let key = self.index.remove(position)?;
        delete_file(&self.record_path(key));
        Some(key)
    }

    /// Number of leading records whose key is at or below `key`.
    pub fn count_through(&self, key: SequenceKey) -> usize {
        self.index.iter().take_while(|k| **k <= key).count()
    }

    /// Delete every record along with the directory, then start empty.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "Failed to delete storage directory");
            }
        }
        self.index.clear();
        self.load()
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: SequenceKey) -> PathBuf {
        self.dir.join(key.to_string())
    }
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

fn write_record(temp: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(temp, path)
}

fn delete_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete file"),
    }
}

/// Remove whatever occupies a record path, file or not.
fn delete_entry(path: &Path) {
    if path.is_dir() {
        if let Err(e) = fs::remove_dir_all(path) {
            warn!(path = %path.display(), error = %e, "Failed to delete entry");
        }
    } else {
        delete_file(path);
    }
}
