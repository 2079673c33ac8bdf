use std::sync::Arc;
use std::time::Duration;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

use crate::concurrency::TaskId;

/// An error produced by user code which has to be handed to more than one
/// waiter, e.g. every caller attached to the same in-flight request.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct SharedError(#[from] pub(crate) Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The underlying error, shared by every clone.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Whether two handles point at the very same error value.
    pub fn ptr_eq(&self, other: &SharedError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(e: anyhow::Error) -> Self {
        SharedError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum KansokuError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Storage error:\n{0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Probe error:\n{0}")]
    Probe(#[from] ProbeError),
}

#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("Task queue is full ({limit} tasks waiting)")]
    QueueFull { limit: usize },

    #[error("Task {id} timed out after {after:?}")]
    Timeout { id: TaskId, after: Duration },

    #[error("Task {id} failed after {attempts} attempt(s): {source}")]
    Failed {
        id: TaskId,
        attempts: u32,
        source: SharedError,
    },

    #[error("Task {id} was cancelled before it started")]
    Cancelled { id: TaskId },

    #[error("Task {id} was aborted: {reason}")]
    Aborted { id: TaskId, reason: String },
}

impl TaskError {
    /// Queue-full rejections are never worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Failed { .. } | TaskError::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Couldn't create a pooled resource.\n{0}")]
    Create(anyhow::Error),

    #[error("Timed out after {0:?} waiting for a pooled resource")]
    AcquireTimeout(Duration),

    #[error("Resource pool was closed")]
    Closed,
}

#[derive(Debug, Error, Clone)]
pub enum CacheError {
    #[error("Producer for '{key}' failed: {source}")]
    Producer { key: String, source: SharedError },

    #[error("Producer for '{key}' was aborted: {reason}")]
    Aborted { key: String, reason: String },

    #[error("Cached value for '{key}' has a different type than requested")]
    TypeMismatch { key: String },
}

impl CacheError {
    /// The producer's own error, if the failure came from the producer.
    pub fn producer_error(&self) -> Option<&SharedError> {
        match self {
            CacheError::Producer { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Storage is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse configuration.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration value '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Heap statistics are unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Userland(#[from] anyhow::Error),
}
