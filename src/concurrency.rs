//! Bounded-parallelism task scheduling.
//!
//! The [`ConcurrencyManager`] accepts any number of asynchronous operations
//! but only keeps `max_concurrent` of them in flight. Waiting work sits in a
//! priority queue which a cooperative poll loop drains:
//!
//! 1. Every `poll_interval` the loop takes the lock and, while a slot is free
//!    and the queue is non-empty, pops the highest-priority task (ties in
//!    submission order) and spawns it.
//! 2. A started task races its retry loop against its timeout. Timeout always
//!    wins and is reported as [`TaskStatus::Timeout`], never as a failure.
//! 3. When the queue and the running set are both empty the loop exits; the
//!    next submission starts a fresh one.
//!
//! Running tasks are never interrupted. Only queued tasks can be cancelled.

mod task;

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;

use crate::core::{BoxFuture, duration_ms, lock};
use crate::error::{SharedError, TaskError};

pub use task::{CancelResult, RetryPredicate, TaskHandle, TaskId, TaskInfo, TaskOptions, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent: usize,
    /// Waiting tasks beyond this count are rejected with `QueueFull`.
    pub queue_limit: usize,
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    pub retry_attempts: u32,
    /// First retry waits this long, every further retry doubles it.
    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Trailing window for throughput and average execution time.
    #[serde(with = "duration_ms")]
    pub metrics_window: Duration,
    /// Finished tasks kept around for `task_info`.
    pub history_limit: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            queue_limit: 100,
            default_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            metrics_window: Duration::from_secs(10),
            history_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConcurrencyMetrics {
    pub max_concurrent: usize,
    pub running: usize,
    pub queued: usize,
    pub peak_running: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Settled tasks per second over the metrics window.
    pub throughput: f64,
    #[serde(with = "duration_ms")]
    pub average_execution: Duration,
    /// Share of settled tasks that failed or timed out.
    pub error_rate: f64,
}

/// How a batch reacts to failures.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Return the first error as soon as it happens.
    pub fail_fast: bool,
    /// Options applied to every task in the batch.
    pub task: TaskOptions,
}

enum Dispatch {
    Start,
    Reject(TaskError),
}

/// Settled state reported back to the manager by a finished task.
struct Settlement {
    status: TaskStatus,
    error: Option<String>,
}

type Job = Box<dyn FnOnce(Dispatch) -> Option<BoxFuture<'static, Settlement>> + Send>;

struct Queued {
    id: TaskId,
    priority: i32,
    job: Job,
}

struct Record {
    info: TaskInfo,
    attempts: Arc<AtomicU32>,
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    cancelled: u64,
}

struct State {
    max_concurrent: usize,
    queue: Vec<Queued>,
    running: HashSet<TaskId>,
    records: HashMap<TaskId, Record>,
    finished: VecDeque<TaskId>,
    completions: VecDeque<(Instant, Duration)>,
    counters: Counters,
    peak_running: usize,
    loop_active: bool,
}

impl State {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    /// Drops completion timings that fell out of the metrics window.
    fn prune_completions(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.completions.front() {
            if now.saturating_duration_since(at) <= window {
                break;
            }
            self.completions.pop_front();
        }
    }
}

struct Shared {
    config: ConcurrencyConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
    idle: Notify,
}

/// Runs asynchronous operations with bounded parallelism.
///
/// Managers are independent: each owns its own queue, running set and
/// metrics. Cloning a manager yields another handle to the same instance.
#[derive(Clone)]
pub struct ConcurrencyManager {
    shared: Arc<Shared>,
}

impl ConcurrencyManager {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    max_concurrent,
                    queue: Vec::new(),
                    running: HashSet::new(),
                    records: HashMap::new(),
                    finished: VecDeque::new(),
                    completions: VecDeque::new(),
                    counters: Counters::default(),
                    peak_running: 0,
                    loop_active: false,
                }),
                next_id: AtomicU64::new(1),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.shared.config
    }

    /// Queues `operation` and waits for its result.
    pub async fn add_task<T, F, Fut>(&self, operation: F, options: TaskOptions) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit(operation, options)?.await
    }

    /// Queues `operation` without waiting for it.
    ///
    /// Fails immediately with [`TaskError::QueueFull`] when `queue_limit`
    /// tasks are already waiting. Must be called inside a tokio runtime.
    pub fn submit<T, F, Fut>(&self, operation: F, options: TaskOptions) -> Result<TaskHandle<T>, TaskError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let config = &self.shared.config;
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Err(TaskError::Aborted {
                id,
                reason: "no async runtime available".into(),
            });
        };

        let timeout = options.timeout.unwrap_or(config.default_timeout);
        let retries = options.retry_attempts.unwrap_or(config.retry_attempts);
        let base_delay = config.retry_base_delay;
        let retry_if = options.retry_if.clone();
        let attempts = Arc::new(AtomicU32::new(0));

        let (tx, rx) = oneshot::channel();
        let job_attempts = attempts.clone();
        let job: Job = Box::new(move |dispatch: Dispatch| match dispatch {
            Dispatch::Start => {
                let future: BoxFuture<'static, Settlement> = Box::pin(async move {
                    let result = run_attempts(
                        id,
                        operation,
                        timeout,
                        retries,
                        base_delay,
                        retry_if,
                        job_attempts,
                    )
                    .await;

                    let settlement = match &result {
                        Ok(_) => Settlement {
                            status: TaskStatus::Completed,
                            error: None,
                        },
                        Err(err) => Settlement {
                            status: if err.is_timeout() {
                                TaskStatus::Timeout
                            } else {
                                TaskStatus::Failed
                            },
                            error: Some(err.to_string()),
                        },
                    };

                    // the awaiting side may have gone away, that's fine
                    let _ = tx.send(result);
                    settlement
                });
                Some(future)
            }
            Dispatch::Reject(err) => {
                let _ = tx.send(Err(err));
                None
            }
        });

        {
            let mut state = lock(&self.shared.state);

            if state.queue.len() >= config.queue_limit {
                tracing::warn!(task = %id, limit = config.queue_limit, "task queue is full");
                return Err(TaskError::QueueFull {
                    limit: config.queue_limit,
                });
            }

            let now = Instant::now();
            state.records.insert(
                id,
                Record {
                    info: TaskInfo {
                        id,
                        status: TaskStatus::Pending,
                        priority: options.priority,
                        attempts: 0,
                        metadata: options.metadata,
                        created_at: now,
                        started_at: None,
                        completed_at: None,
                        error: None,
                    },
                    attempts,
                },
            );

            // Keep the queue sorted: after every task of equal or higher
            // priority, so equal priorities stay in submission order.
            let position = state
                .queue
                .iter()
                .position(|queued| queued.priority < options.priority)
                .unwrap_or(state.queue.len());
            state.queue.insert(
                position,
                Queued {
                    id,
                    priority: options.priority,
                    job,
                },
            );
            state.counters.submitted += 1;

            if !state.loop_active {
                state.loop_active = true;
                runtime.spawn(poll_loop(self.shared.clone()));
            }
        }

        tracing::debug!(task = %id, priority = options.priority, "task queued");
        Ok(TaskHandle { id, rx })
    }

    /// Runs every operation and returns their results in input order.
    ///
    /// With `fail_fast` the first error is returned as soon as it happens;
    /// the remaining tasks keep running in the background. Without it, every
    /// task settles and its outcome lands in its slot of the returned vector.
    pub async fn add_batch_tasks<T, F, Fut>(
        &self,
        operations: Vec<F>,
        options: BatchOptions,
    ) -> Result<Vec<Result<T, TaskError>>, TaskError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut handles = Vec::with_capacity(operations.len());
        for operation in operations {
            match self.submit(operation, options.task.clone()) {
                Ok(handle) => handles.push(Ok(handle)),
                Err(err) if options.fail_fast => return Err(err),
                Err(err) => handles.push(Err(err)),
            }
        }

        if !options.fail_fast {
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                results.push(match handle {
                    Ok(handle) => handle.await,
                    Err(err) => Err(err),
                });
            }
            return Ok(results);
        }

        let count = handles.len();
        let mut set = JoinSet::new();
        for (index, handle) in handles.into_iter().enumerate() {
            let Ok(handle) = handle else { continue };
            set.spawn(async move { (index, handle.await) });
        }

        let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(value))) => slots[index] = Some(value),
                Ok((_, Err(err))) => return Err(err),
                Err(err) => {
                    return Err(TaskError::Aborted {
                        id: TaskId(0),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| TaskError::Aborted {
                    id: TaskId(0),
                    reason: "batch slot never settled".into(),
                })
            })
            .collect())
    }

    /// Cancels a task that has not started yet.
    pub fn cancel_task(&self, id: TaskId) -> CancelResult {
        let job = {
            let mut state = lock(&self.shared.state);

            match state.queue.iter().position(|queued| queued.id == id) {
                Some(position) => {
                    let queued = state.queue.remove(position);
                    state.counters.cancelled += 1;
                    settle_record(&mut state, id, TaskStatus::Cancelled, None, self.shared.config.history_limit);
                    queued.job
                }
                None if state.running.contains(&id) => {
                    tracing::warn!(task = %id, "running tasks cannot be cancelled");
                    return CancelResult::NotCancellable;
                }
                None if state.records.contains_key(&id) => return CancelResult::AlreadyFinished,
                None => return CancelResult::NotFound,
            }
        };

        job(Dispatch::Reject(TaskError::Cancelled { id }));
        self.notify_if_idle();
        tracing::debug!(task = %id, "task cancelled");
        CancelResult::Cancelled
    }

    /// Cancels every queued task. Returns how many were removed.
    pub fn cancel_all_pending(&self) -> usize {
        let jobs: Vec<_> = {
            let mut state = lock(&self.shared.state);
            let queued = std::mem::take(&mut state.queue);
            for item in &queued {
                state.counters.cancelled += 1;
                settle_record(&mut state, item.id, TaskStatus::Cancelled, None, self.shared.config.history_limit);
            }
            queued
        };

        let count = jobs.len();
        for queued in jobs {
            (queued.job)(Dispatch::Reject(TaskError::Cancelled { id: queued.id }));
        }
        self.notify_if_idle();
        count
    }

    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        lock(&self.shared.state)
            .records
            .get(&id)
            .map(|record| record.info.status)
    }

    pub fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        lock(&self.shared.state).records.get(&id).map(|record| {
            let mut info = record.info.clone();
            info.attempts = record.attempts.load(Ordering::Relaxed);
            info
        })
    }

    /// Changes the parallelism bound. Already running tasks are unaffected;
    /// lowering the bound only delays new starts.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let mut state = lock(&self.shared.state);
        state.max_concurrent = max_concurrent.max(1);
        tracing::debug!(max_concurrent = state.max_concurrent, "concurrency bound changed");
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.shared.state).is_idle()
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn metrics(&self) -> ConcurrencyMetrics {
        let now = Instant::now();
        let window = self.shared.config.metrics_window;
        let mut state = lock(&self.shared.state);
        state.prune_completions(now, window);

        let recent = state.completions.len();
        let average_execution = if recent == 0 {
            Duration::ZERO
        } else {
            let total = state.completions.iter().map(|(_, d)| *d).sum::<Duration>();
            total.div_f64(recent as f64)
        };

        let counters = &state.counters;
        let settled = counters.completed + counters.failed + counters.timed_out;
        let error_rate = if settled == 0 {
            0.0
        } else {
            (counters.failed + counters.timed_out) as f64 / settled as f64
        };

        ConcurrencyMetrics {
            max_concurrent: state.max_concurrent,
            running: state.running.len(),
            queued: state.queue.len(),
            peak_running: state.peak_running,
            submitted: counters.submitted,
            completed: counters.completed,
            failed: counters.failed,
            timed_out: counters.timed_out,
            cancelled: counters.cancelled,
            throughput: recent as f64 / window.as_secs_f64().max(f64::EPSILON),
            average_execution,
            error_rate,
        }
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.shared.idle.notify_waiters();
        }
    }
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

impl std::fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("config", &self.shared.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

async fn run_attempts<T, F, Fut>(
    id: TaskId,
    operation: F,
    timeout: Duration,
    retries: u32,
    base_delay: Duration,
    retry_if: Option<RetryPredicate>,
    attempts: Arc<AtomicU32>,
) -> Result<T, TaskError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempt_loop = async {
        let mut attempt = 0u32;
        loop {
            attempts.store(attempt + 1, Ordering::Relaxed);

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retryable = retry_if.as_ref().is_none_or(|predicate| predicate(&err));
            if attempt >= retries || !retryable {
                return Err(TaskError::Failed {
                    id,
                    attempts: attempt + 1,
                    source: SharedError::from(err),
                });
            }

            let delay = base_delay.saturating_mul(2u32.saturating_pow(attempt));
            tracing::debug!(task = %id, attempt = attempt + 1, ?delay, "attempt failed, retrying: {err}");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    };

    match tokio::time::timeout(timeout, attempt_loop).await {
        Ok(result) => result,
        Err(_) => Err(TaskError::Timeout { id, after: timeout }),
    }
}

async fn poll_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let started = {
            let mut state = lock(&shared.state);

            if state.is_idle() {
                state.loop_active = false;
                break;
            }

            let mut started = Vec::new();
            while state.running.len() < state.max_concurrent && !state.queue.is_empty() {
                let queued = state.queue.remove(0);
                state.running.insert(queued.id);
                state.peak_running = state.peak_running.max(state.running.len());
                if let Some(record) = state.records.get_mut(&queued.id) {
                    record.info.status = TaskStatus::Running;
                    record.info.started_at = Some(Instant::now());
                }
                started.push(queued);
            }
            started
        };

        for queued in started {
            let Some(future) = (queued.job)(Dispatch::Start) else {
                continue;
            };
            tokio::spawn(supervise(shared.clone(), queued.id, queued.priority, future));
        }
    }

    tracing::trace!("task queue drained, poll loop stopped");
}

/// Drives one task to completion and folds its outcome back into the
/// manager's state. The task body runs on its own tokio task so a panic is
/// contained and still frees the slot.
async fn supervise(shared: Arc<Shared>, id: TaskId, priority: i32, future: BoxFuture<'static, Settlement>) {
    let span = tracing::debug_span!("task", id = %id, priority);
    let settlement = match tokio::spawn(future.instrument(span)).await {
        Ok(settlement) => settlement,
        Err(err) => {
            tracing::error!(task = %id, "task aborted: {err}");
            Settlement {
                status: TaskStatus::Failed,
                error: Some(format!("task aborted: {err}")),
            }
        }
    };

    let idle = {
        let mut state = lock(&shared.state);
        let now = Instant::now();

        state.running.remove(&id);
        match settlement.status {
            TaskStatus::Completed => state.counters.completed += 1,
            TaskStatus::Timeout => state.counters.timed_out += 1,
            _ => state.counters.failed += 1,
        }

        let started = state
            .records
            .get(&id)
            .and_then(|record| record.info.started_at)
            .unwrap_or(now);
        state
            .completions
            .push_back((now, now.saturating_duration_since(started)));
        state.prune_completions(now, shared.config.metrics_window);

        if let Some(error) = &settlement.error {
            tracing::debug!(task = %id, status = ?settlement.status, "task settled with error: {error}");
        }

        settle_record(&mut state, id, settlement.status, settlement.error, shared.config.history_limit);
        state.is_idle()
    };

    if idle {
        shared.idle.notify_waiters();
    }
}

fn settle_record(state: &mut State, id: TaskId, status: TaskStatus, error: Option<String>, history_limit: usize) {
    if let Some(record) = state.records.get_mut(&id) {
        record.info.status = status;
        record.info.completed_at = Some(Instant::now());
        record.info.error = error;
    }

    state.finished.push_back(id);
    while state.finished.len() > history_limit {
        if let Some(old) = state.finished.pop_front() {
            state.records.remove(&old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager(max_concurrent: usize) -> ConcurrencyManager {
        ConcurrencyManager::new(ConcurrencyConfig {
            max_concurrent,
            retry_attempts: 0,
            retry_base_delay: Duration::from_millis(100),
            ..Default::default()
        })
    }

    /// Counts how many operations are inside their body at once.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    struct GaugeGuard(Arc<Gauge>);

    impl Gauge {
        fn enter(self: &Arc<Self>) -> GaugeGuard {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            GaugeGuard(self.clone())
        }
    }

    impl Drop for GaugeGuard {
        fn drop(&mut self) {
            self.0.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_task_returns_value() {
        let manager = manager(2);
        let value = manager
            .add_task(|| async { Ok(21 * 2) }, TaskOptions::new())
            .await
            .unwrap();

        assert_eq!(value, 42);
        manager.wait_idle().await;
        let metrics = manager.metrics();
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound() {
        let manager = manager(3);
        let gauge = Arc::new(Gauge::default());
        let release = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gauge = gauge.clone();
            let release = release.clone();
            let handle = manager
                .submit(
                    move || {
                        let gauge = gauge.clone();
                        let release = release.clone();
                        async move {
                            let _guard = gauge.enter();
                            release.notified().await;
                            Ok(())
                        }
                    },
                    TaskOptions::new().timeout(Duration::from_secs(60)),
                )
                .unwrap();
            handles.push(handle);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.metrics().running, 3);
        assert_eq!(manager.metrics().queued, 5);

        // release in rounds until everything drained
        for _ in 0..10 {
            release.notify_waiters();
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(manager.metrics().running <= 3);
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
        assert_eq!(manager.metrics().peak_running, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order() {
        let manager = manager(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // occupy the only slot
        let blocker = manager
            .submit(
                || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok("blocker")
                },
                TaskOptions::new(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;

        let mut handles = Vec::new();
        for (name, priority) in [("low", 1), ("high", 5), ("low-2", 1), ("high-2", 5)] {
            let order = order.clone();
            handles.push(
                manager
                    .submit(
                        move || {
                            let order = order.clone();
                            async move {
                                lock(&order).push(name);
                                Ok(name)
                            }
                        },
                        TaskOptions::new().priority(priority),
                    )
                    .unwrap(),
            );
        }

        blocker.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*lock(&order), vec!["high", "high-2", "low", "low-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_is_immediate() {
        let manager = ConcurrencyManager::new(ConcurrencyConfig {
            max_concurrent: 1,
            queue_limit: 2,
            ..Default::default()
        });

        let mut handles = Vec::new();
        for _ in 0..2 {
            handles.push(
                manager
                    .submit(|| async { Ok(()) }, TaskOptions::new())
                    .unwrap(),
            );
        }

        let err = manager
            .submit(|| async { Ok(()) }, TaskOptions::new())
            .unwrap_err();
        assert!(matches!(err, TaskError::QueueFull { limit: 2 }));
        assert!(!err.is_retryable());

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff() {
        let manager = manager(1);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let recorded = calls.clone();
        let result = manager
            .add_task(
                move || {
                    let recorded = recorded.clone();
                    async move {
                        let attempt = {
                            let mut calls = lock(&recorded);
                            calls.push(Instant::now());
                            calls.len()
                        };
                        if attempt < 3 {
                            anyhow::bail!("attempt {attempt} failed");
                        }
                        Ok(attempt)
                    }
                },
                TaskOptions::new().retries(2).timeout(Duration::from_secs(10)),
            )
            .await;

        assert_eq!(result.unwrap(), 3);

        let calls = lock(&calls);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_millis(100));
        assert!(second_gap >= Duration::from_millis(200));
        assert!(second_gap > first_gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let manager = manager(1);
        let handle = manager
            .submit(
                || async { Err::<(), _>(anyhow::anyhow!("always broken")) },
                TaskOptions::new().retries(2).timeout(Duration::from_secs(10)),
            )
            .unwrap();
        let id = handle.id();

        match handle.await {
            Err(TaskError::Failed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
        manager.wait_idle().await;
        assert_eq!(manager.task_status(id), Some(TaskStatus::Failed));
        assert_eq!(manager.task_info(id).unwrap().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_predicate_limits_retries() {
        let manager = manager(1);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result = manager
            .add_task(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(anyhow::anyhow!("404 not found"))
                    }
                },
                TaskOptions::new()
                    .retries(5)
                    .retry_if(|err| err.to_string().starts_with("5")),
            )
            .await;

        assert!(matches!(result, Err(TaskError::Failed { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_beats_retries() {
        let manager = manager(1);
        let handle = manager
            .submit(
                || async { Err::<(), _>(anyhow::anyhow!("flaky")) },
                TaskOptions::new().retries(10).timeout(Duration::from_millis(250)),
            )
            .unwrap();
        let id = handle.id();

        let err = handle.await.unwrap_err();
        assert!(err.is_timeout());
        manager.wait_idle().await;
        assert_eq!(manager.task_status(id), Some(TaskStatus::Timeout));
        assert_eq!(manager.metrics().timed_out, 1);
        assert_eq!(manager.metrics().failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_and_running() {
        let manager = manager(1);
        let running = manager
            .submit(
                || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(1)
                },
                TaskOptions::new(),
            )
            .unwrap();
        let queued = manager
            .submit(|| async { Ok(2) }, TaskOptions::new())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.cancel_task(running.id()), CancelResult::NotCancellable);
        let queued_id = queued.id();
        assert_eq!(manager.cancel_task(queued_id), CancelResult::Cancelled);
        assert_eq!(manager.cancel_task(queued_id), CancelResult::AlreadyFinished);
        assert_eq!(manager.cancel_task(TaskId(999)), CancelResult::NotFound);

        assert!(matches!(queued.await, Err(TaskError::Cancelled { .. })));
        assert_eq!(running.await.unwrap(), 1);
        assert_eq!(manager.task_status(queued_id), Some(TaskStatus::Cancelled));
        assert_eq!(manager.metrics().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_pending() {
        let manager = manager(1);
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(
                manager
                    .submit(
                        || async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(())
                        },
                        TaskOptions::new(),
                    )
                    .unwrap(),
            );
        }

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(manager.cancel_all_pending(), 3);

        let results: Vec<_> = {
            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await);
            }
            results
        };
        assert!(results[0].is_ok());
        assert!(results[1..]
            .iter()
            .all(|r| matches!(r, Err(TaskError::Cancelled { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_settles_all() {
        let manager = manager(2);
        let operations: Vec<_> = (0..4)
            .map(|i| {
                move || async move {
                    tokio::time::sleep(Duration::from_millis(10 * (4 - i))).await;
                    if i == 2 {
                        anyhow::bail!("task {i} failed");
                    }
                    Ok(i)
                }
            })
            .collect();

        let results = manager
            .add_batch_tasks(operations, BatchOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap(), &0);
        assert_eq!(results[1].as_ref().unwrap(), &1);
        assert!(results[2].is_err());
        assert_eq!(results[3].as_ref().unwrap(), &3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_fail_fast() {
        let manager = manager(4);
        let operations: Vec<_> = (0..4u64)
            .map(|i| {
                move || async move {
                    if i == 1 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        anyhow::bail!("early failure");
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(i)
                }
            })
            .collect();

        let started = Instant::now();
        let result = manager
            .add_batch_tasks(
                operations,
                BatchOptions {
                    fail_fast: true,
                    task: TaskOptions::new().retries(0),
                },
            )
            .await;

        assert!(matches!(result, Err(TaskError::Failed { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_restarts_after_idle() {
        let manager = manager(2);
        manager.add_task(|| async { Ok(()) }, TaskOptions::new()).await.unwrap();
        manager.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!lock(&manager.shared.state).loop_active);

        let value = manager.add_task(|| async { Ok(7) }, TaskOptions::new()).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_frees_slot() {
        let manager = manager(1);
        let result = manager
            .add_task(
                || async {
                    if true {
                        panic!("task body exploded");
                    }
                    Ok(())
                },
                TaskOptions::new(),
            )
            .await;
        assert!(matches!(result, Err(TaskError::Aborted { .. })));

        manager.wait_idle().await;
        assert_eq!(manager.metrics().running, 0);
        assert_eq!(manager.add_task(|| async { Ok(1) }, TaskOptions::new()).await.unwrap(), 1);
    }

    /// Ten tasks through three slots: three quick ones, one that overruns its
    /// deadline, six short ones.
    #[tokio::test(start_paused = true)]
    async fn test_mixed_workload_scenario() {
        let manager = manager(3);
        let gauge = Arc::new(Gauge::default());

        let mut handles = Vec::new();
        for n in 1..=10u64 {
            let duration = match n {
                1..=3 => Duration::from_millis(50),
                4 => Duration::from_millis(200),
                _ => Duration::from_millis(10),
            };
            let gauge = gauge.clone();
            handles.push(
                manager
                    .submit(
                        move || {
                            let gauge = gauge.clone();
                            async move {
                                let _guard = gauge.enter();
                                tokio::time::sleep(duration).await;
                                Ok(n)
                            }
                        },
                        TaskOptions::new().timeout(Duration::from_millis(100)),
                    )
                    .unwrap(),
            );
        }

        let sampler = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut max_seen = 0;
                for _ in 0..100 {
                    max_seen = max_seen.max(manager.metrics().running);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                max_seen
            })
        };

        let mut completed = 0;
        let mut timeouts = 0;
        for handle in handles {
            match handle.await {
                Ok(_) => completed += 1,
                Err(err) if err.is_timeout() => timeouts += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }

        assert_eq!(completed, 9);
        assert_eq!(timeouts, 1);
        assert!(sampler.await.unwrap() <= 3);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);

        manager.wait_idle().await;
        let metrics = manager.metrics();
        assert_eq!(metrics.completed, 9);
        assert_eq!(metrics.timed_out, 1);
        assert!((metrics.error_rate - 0.1).abs() < 1e-9);
        assert!(metrics.throughput > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_timings_stay_bounded() {
        let manager = ConcurrencyManager::new(ConcurrencyConfig {
            max_concurrent: 1,
            metrics_window: Duration::from_millis(10),
            ..Default::default()
        });

        for n in 0..500u32 {
            let value = manager
                .add_task(move || async move { Ok(n) }, TaskOptions::new())
                .await
                .unwrap();
            assert_eq!(value, n);
            manager.wait_idle().await;
            tokio::time::advance(Duration::from_millis(20)).await;
        }

        let retained = lock(&manager.shared.state).completions.len();
        assert!(retained <= 1, "completions grew to {retained}");
        assert_eq!(manager.metrics().completed, 500);
    }
}
