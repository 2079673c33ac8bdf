use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::TaskError;

/// Identifier of a task, unique within one [`ConcurrencyManager`](super::ConcurrencyManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Outcome of a cancellation request.
///
/// Running work cannot be interrupted, so "the task is already running" is a
/// distinct answer rather than a silent `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The task was still queued and has been removed.
    Cancelled,
    /// The task is running and will be allowed to finish.
    NotCancellable,
    /// The task already settled.
    AlreadyFinished,
    /// No task with this id is known.
    NotFound,
}

/// Decides whether a failed attempt should be retried.
pub type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Per-task settings. Unset fields fall back to the manager's configuration.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub retry_attempts: Option<u32>,
    pub retry_if: Option<RetryPredicate>,
    pub metadata: serde_json::Value,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    /// Only errors accepted by `predicate` are retried.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

impl std::fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOptions")
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_if", &self.retry_if.as_ref().map(|_| "<predicate>"))
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// A snapshot of what the manager knows about one task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub status: TaskStatus,
    pub priority: i32,
    pub attempts: u32,
    pub metadata: serde_json::Value,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub error: Option<String>,
}

impl TaskInfo {
    /// Time spent running, if the task started.
    pub fn execution_time(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(start))
    }
}

/// The eventual result of a submitted task.
///
/// Awaiting the handle yields the operation's value or its final error.
/// Dropping it does not cancel the task; use
/// [`ConcurrencyManager::cancel_task`](super::ConcurrencyManager::cancel_task)
/// with [`TaskHandle::id`] for that.
#[derive(Debug)]
pub struct TaskHandle<T> {
    pub(crate) id: TaskId,
    pub(crate) rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Aborted {
                id: this.id,
                reason: "task was dropped before it settled".into(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
