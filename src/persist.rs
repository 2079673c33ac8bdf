//! Best-effort durability for logs and cache inspection data.
//!
//! Nothing in this crate depends on a sink for correctness. Sinks exist so a
//! host can inspect what happened after the fact; every caller treats a sink
//! failure as a log line, never as an error of its own.

use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::lock;
use crate::error::StorageError;

/// Key under which the logger appends flushed entries.
pub const LOGS_KEY: &str = "kansoku.logs";

/// Key under which the request cache mirrors its index.
pub const CACHE_INDEX_KEY: &str = "kansoku.cache.index";

/// A key-value store that may refuse writes at any time.
pub trait DurabilitySink: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Discards everything. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DurabilitySink for NoopSink {
    fn load(&self, _: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(None)
    }

    fn store(&self, _: &str, _: &[u8]) -> Result<(), StorageError> {
        Ok(())
    }

    fn remove(&self, _: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

/// In-memory sink with an optional byte quota, which behaves like a browser's
/// local storage when it runs out of room.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    quota: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::default(),
            quota: Some(quota),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = lock(&self.entries).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total bytes currently stored.
    pub fn used(&self) -> usize {
        lock(&self.entries).values().map(Vec::len).sum()
    }
}

impl DurabilitySink for MemorySink {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut entries = lock(&self.entries);

        if let Some(quota) = self.quota {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            let available = quota.saturating_sub(others);
            if value.len() > available {
                return Err(StorageError::QuotaExceeded {
                    needed: value.len(),
                    available,
                });
            }
        }

        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Stores every key as a file in a directory.
#[derive(Debug, Clone)]
pub struct FileSink {
    root: Utf8PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, key: &str) -> Utf8PathBuf {
        // Keys are dotted identifiers; anything else is flattened so a key can
        // never escape the root directory.
        let name: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        self.root.join(format!("{name}.json"))
    }
}

impl DurabilitySink for FileSink {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.path(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Serializes `value` as JSON and stores it, logging instead of failing.
pub(crate) fn mirror_json<T>(sink: &dyn DurabilitySink, key: &str, value: &T) -> bool
where
    T: serde::Serialize + ?Sized,
{
    let result = serde_json::to_vec(value)
        .map_err(StorageError::from)
        .and_then(|bytes| sink.store(key, &bytes));

    match result {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(key, "couldn't persist state: {err}");
            false
        }
    }
}

/// Loads and decodes a JSON value, treating any failure as absence.
pub(crate) fn load_json<T>(sink: &dyn DurabilitySink, key: &str) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    match sink.load(key) {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key, "discarding unreadable persisted state: {err}");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            tracing::warn!(key, "couldn't read persisted state: {err}");
            None
        }
    }
}
