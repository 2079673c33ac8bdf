//! Heuristic contention monitor.
//!
//! There are no CPU counters to read, so contention is inferred: a fixed-cost
//! busy loop runs on every sample, and any wall-clock time it needs beyond a
//! calibrated baseline is taken as scheduling delay. Recent long tasks add a
//! penalty on top. The resulting number moves the right way when the host is
//! busier, but it is an estimate, not a measurement.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hint::black_box;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::{duration_ms, fmt_ms, lock};
use crate::history::RollingHistory;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    #[serde(with = "duration_ms")]
    pub sample_interval: Duration,
    /// Iterations of the busy loop run by every probe.
    pub probe_iterations: u32,
    /// Probes run to establish the baseline; the fastest one wins.
    pub calibration_samples: u32,
    #[serde(with = "duration_ms")]
    pub long_task_threshold: Duration,
    #[serde(with = "duration_ms")]
    pub long_task_window: Duration,
    #[serde(with = "duration_ms")]
    pub heavy_function_threshold: Duration,
    pub history_size: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            probe_iterations: 100_000,
            calibration_samples: 5,
            long_task_threshold: Duration::from_millis(50),
            long_task_window: Duration::from_secs(5),
            heavy_function_threshold: Duration::from_millis(16),
            history_size: 60,
        }
    }
}

/// A unit of work that blocked the executor for a while.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTask {
    pub name: Option<String>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl LongTask {
    pub fn new(duration: Duration) -> Self {
        Self {
            name: None,
            duration,
        }
    }

    pub fn named(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: Some(name.into()),
            duration,
        }
    }
}

/// Inputs of the usage estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuSignals {
    /// Probe duration divided by the baseline. 1.0 means uncontended.
    pub probe_delay_ratio: f64,
    pub long_task_count: usize,
    pub long_task_time: Duration,
    /// Window the long tasks were counted over.
    pub window: Duration,
}

/// Folds the signals into a usage figure in `0.0..=100.0`.
///
/// Probe delay saturates towards 80: doubling the probe cost reads as 40,
/// tripling it as about 53. Every long task adds 5, and the share of the
/// window spent in long tasks adds up to 40 more. Each term only grows with
/// its input, so the estimate never drops when contention rises.
pub fn estimate_usage(signals: &CpuSignals) -> f64 {
    let ratio = if signals.probe_delay_ratio.is_finite() {
        signals.probe_delay_ratio
    } else {
        1.0
    };

    let delay = (ratio - 1.0).max(0.0);
    let contention = 80.0 * delay / (delay + 1.0);

    let count_penalty = signals.long_task_count as f64 * 5.0;

    let blocked_share = if signals.window.is_zero() {
        0.0
    } else {
        (signals.long_task_time.as_secs_f64() / signals.window.as_secs_f64()).min(1.0)
    };
    let time_penalty = blocked_share * 40.0;

    (contention + count_penalty + time_penalty).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuUsageData {
    /// Estimated usage in percent.
    pub usage: f64,
    pub probe_delay_ratio: f64,
    #[serde(with = "duration_ms")]
    pub probe_time: Duration,
    pub long_tasks: usize,
    #[serde(with = "duration_ms")]
    pub long_task_time: Duration,
    pub heavy_functions: usize,
    #[serde(skip)]
    pub at: Instant,
}

/// Timing statistics of one measured function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionStats {
    pub name: String,
    pub calls: u64,
    #[serde(with = "duration_ms")]
    pub total: Duration,
    #[serde(with = "duration_ms")]
    pub min: Duration,
    #[serde(with = "duration_ms")]
    pub max: Duration,
}

impl FunctionStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    fn record(&mut self, duration: Duration) {
        self.calls += 1;
        self.total += duration;
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
    }

    pub fn average(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        self.total.div_f64(self.calls as f64)
    }
}

struct CpuState {
    baseline: Option<Duration>,
    history: RollingHistory<CpuUsageData>,
    long_tasks: VecDeque<(Instant, Duration)>,
    functions: HashMap<String, FunctionStats>,
}

struct CpuInner {
    config: CpuConfig,
    state: Mutex<CpuState>,
    tx: broadcast::Sender<CpuUsageData>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for CpuInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

/// Periodically estimates executor contention.
#[derive(Clone)]
pub struct CpuMonitor {
    inner: Arc<CpuInner>,
}

impl CpuMonitor {
    pub fn new(config: CpuConfig) -> Self {
        let (tx, _) = broadcast::channel(64);
        let history = RollingHistory::new(config.history_size);
        Self {
            inner: Arc::new(CpuInner {
                config,
                state: Mutex::new(CpuState {
                    baseline: None,
                    history,
                    long_tasks: VecDeque::new(),
                    functions: HashMap::new(),
                }),
                tx,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CpuConfig {
        &self.inner.config
    }

    /// Starts periodic sampling. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sample_interval;
        *task = Some(tokio::spawn(sample_loop(weak, period)));
        tracing::debug!(?period, "cpu monitor started");
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.task).take() {
            handle.abort();
            tracing::debug!("cpu monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Overrides the probe baseline instead of calibrating on first use.
    pub fn set_baseline(&self, baseline: Duration) {
        lock(&self.inner.state).baseline = Some(baseline.max(Duration::from_nanos(1)));
    }

    pub fn baseline(&self) -> Option<Duration> {
        lock(&self.inner.state).baseline
    }

    /// Runs the probe now and records the resulting estimate.
    pub fn sample_now(&self) -> CpuUsageData {
        if self.baseline().is_none() {
            let baseline = (0..self.inner.config.calibration_samples.max(1))
                .map(|_| run_probe(self.inner.config.probe_iterations))
                .min()
                .unwrap_or(Duration::from_nanos(1));
            tracing::debug!(baseline = %fmt_ms(baseline), "cpu probe calibrated");
            self.set_baseline(baseline);
        }

        let probe = run_probe(self.inner.config.probe_iterations);
        self.record_probe(probe)
    }

    /// Records a probe that took `probe_time` and publishes the estimate.
    pub fn record_probe(&self, probe_time: Duration) -> CpuUsageData {
        let now = Instant::now();
        let window = self.inner.config.long_task_window;
        let heavy_threshold = self.inner.config.heavy_function_threshold;

        let data = {
            let mut state = lock(&self.inner.state);
            let baseline = *state.baseline.get_or_insert(probe_time.max(Duration::from_nanos(1)));

            prune_long_tasks(&mut state.long_tasks, now, window);
            let long_task_time = state.long_tasks.iter().map(|(_, d)| *d).sum();

            let signals = CpuSignals {
                probe_delay_ratio: probe_time.as_secs_f64() / baseline.as_secs_f64(),
                long_task_count: state.long_tasks.len(),
                long_task_time,
                window,
            };

            let data = CpuUsageData {
                usage: estimate_usage(&signals),
                probe_delay_ratio: signals.probe_delay_ratio,
                probe_time,
                long_tasks: signals.long_task_count,
                long_task_time,
                heavy_functions: state
                    .functions
                    .values()
                    .filter(|stats| stats.average() > heavy_threshold)
                    .count(),
                at: now,
            };
            state.history.push(data.clone());
            data
        };

        tracing::trace!(usage = data.usage, "cpu sample");
        let _ = self.inner.tx.send(data.clone());
        data
    }

    /// Records a long task. Tasks at or under the threshold are ignored.
    pub fn record_long_task(&self, task: LongTask) -> bool {
        if task.duration <= self.inner.config.long_task_threshold {
            return false;
        }

        tracing::debug!(
            name = task.name.as_deref().unwrap_or("<anonymous>"),
            duration = %fmt_ms(task.duration),
            "long task observed"
        );
        lock(&self.inner.state)
            .long_tasks
            .push_back((Instant::now(), task.duration));
        true
    }

    /// Long tasks seen within the window.
    pub fn long_task_count(&self) -> usize {
        let mut state = lock(&self.inner.state);
        prune_long_tasks(&mut state.long_tasks, Instant::now(), self.inner.config.long_task_window);
        state.long_tasks.len()
    }

    /// Times a synchronous call and records it under `name`.
    pub fn measure<R>(&self, name: &str, f: impl FnOnce() -> R) -> R {
        let start = std::time::Instant::now();
        let result = f();
        self.record_call(name, start.elapsed());
        result
    }

    /// Times a future to completion and records it under `name`.
    pub async fn measure_async<F: Future>(&self, name: &str, fut: F) -> F::Output {
        let start = Instant::now();
        let result = fut.await;
        self.record_call(name, start.elapsed());
        result
    }

    pub fn record_call(&self, name: &str, duration: Duration) {
        let mut state = lock(&self.inner.state);
        state
            .functions
            .entry(name.to_string())
            .or_insert_with(|| FunctionStats::new(name))
            .record(duration);
    }

    pub fn function(&self, name: &str) -> Option<FunctionStats> {
        lock(&self.inner.state).functions.get(name).cloned()
    }

    /// Functions whose average exceeds the heavy threshold, slowest first.
    pub fn heavy_functions(&self) -> Vec<FunctionStats> {
        let threshold = self.inner.config.heavy_function_threshold;
        let mut heavy: Vec<_> = lock(&self.inner.state)
            .functions
            .values()
            .filter(|stats| stats.average() > threshold)
            .cloned()
            .collect();
        heavy.sort_by(|a, b| b.average().cmp(&a.average()));
        heavy
    }

    pub fn current(&self) -> Option<CpuUsageData> {
        lock(&self.inner.state).history.latest().cloned()
    }

    pub fn history(&self) -> Vec<CpuUsageData> {
        lock(&self.inner.state).history.to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CpuUsageData> {
        self.inner.tx.subscribe()
    }

    /// Forgets history, long tasks, function stats and the baseline.
    pub fn reset(&self) {
        let mut state = lock(&self.inner.state);
        state.baseline = None;
        state.history.clear();
        state.long_tasks.clear();
        state.functions.clear();
    }
}

impl Default for CpuMonitor {
    fn default() -> Self {
        Self::new(CpuConfig::default())
    }
}

impl std::fmt::Debug for CpuMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuMonitor")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

fn prune_long_tasks(tasks: &mut VecDeque<(Instant, Duration)>, now: Instant, window: Duration) {
    while let Some(&(at, _)) = tasks.front() {
        if now.saturating_duration_since(at) <= window {
            break;
        }
        tasks.pop_front();
    }
}

/// The fixed-cost workload timed by every sample.
fn run_probe(iterations: u32) -> Duration {
    let start = std::time::Instant::now();
    let mut acc = 0u64;
    for i in 0..iterations {
        acc = black_box(acc.wrapping_mul(31).wrapping_add(u64::from(i)));
    }
    black_box(acc);
    start.elapsed()
}

async fn sample_loop(weak: Weak<CpuInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let monitor = CpuMonitor { inner };
        monitor.sample_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(ratio: f64, count: usize, time_ms: u64) -> CpuSignals {
        CpuSignals {
            probe_delay_ratio: ratio,
            long_task_count: count,
            long_task_time: Duration::from_millis(time_ms),
            window: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_estimate_is_bounded() {
        assert_eq!(estimate_usage(&signals(1.0, 0, 0)), 0.0);
        assert_eq!(estimate_usage(&signals(0.5, 0, 0)), 0.0);
        assert_eq!(estimate_usage(&signals(f64::NAN, 0, 0)), 0.0);
        assert_eq!(estimate_usage(&signals(1e9, 1000, 1_000_000)), 100.0);

        for ratio in [1.0, 1.5, 3.0, 50.0] {
            for count in [0, 2, 10] {
                let usage = estimate_usage(&signals(ratio, count, count as u64 * 80));
                assert!((0.0..=100.0).contains(&usage));
            }
        }
    }

    #[test]
    fn test_estimate_is_monotone() {
        let base = estimate_usage(&signals(1.5, 1, 80));

        assert!(estimate_usage(&signals(2.5, 1, 80)) > base);
        assert!(estimate_usage(&signals(1.5, 3, 80)) > base);
        assert!(estimate_usage(&signals(1.5, 1, 400)) > base);

        let mut last = 0.0;
        for count in 0..20 {
            let usage = estimate_usage(&signals(1.2, count, count as u64 * 60));
            assert!(usage >= last);
            last = usage;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_tasks_raise_usage() {
        let monitor = CpuMonitor::default();
        monitor.set_baseline(Duration::from_millis(1));

        let quiet = monitor.record_probe(Duration::from_millis(1));
        assert_eq!(quiet.usage, 0.0);

        assert!(!monitor.record_long_task(LongTask::new(Duration::from_millis(30))));
        assert!(monitor.record_long_task(LongTask::named("hydrate", Duration::from_millis(120))));
        assert!(monitor.record_long_task(LongTask::new(Duration::from_millis(200))));

        let busy = monitor.record_probe(Duration::from_millis(1));
        assert_eq!(busy.long_tasks, 2);
        assert!(busy.usage > quiet.usage);

        // long tasks fall out of the window
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(monitor.long_task_count(), 0);
        let calm = monitor.record_probe(Duration::from_millis(1));
        assert!(calm.usage < busy.usage);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slower_probe_reads_higher() {
        let monitor = CpuMonitor::default();
        monitor.set_baseline(Duration::from_millis(2));

        let a = monitor.record_probe(Duration::from_millis(2));
        let b = monitor.record_probe(Duration::from_millis(4));
        let c = monitor.record_probe(Duration::from_millis(8));
        assert!(a.usage < b.usage && b.usage < c.usage);
        assert_eq!(monitor.history().len(), 3);
        assert_eq!(monitor.current(), Some(c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heavy_functions() {
        let monitor = CpuMonitor::default();

        let value = monitor.measure("parse", || 2 + 2);
        assert_eq!(value, 4);

        monitor
            .measure_async("render", tokio::time::sleep(Duration::from_millis(30)))
            .await;
        monitor.record_call("render", Duration::from_millis(20));
        monitor.record_call("format", Duration::from_millis(40));

        let render = monitor.function("render").unwrap();
        assert_eq!(render.calls, 2);
        assert_eq!(render.min, Duration::from_millis(20));
        assert!(render.max >= Duration::from_millis(30));
        assert!(render.average() >= Duration::from_millis(25));

        let heavy: Vec<_> = monitor.heavy_functions().into_iter().map(|f| f.name).collect();
        assert_eq!(heavy, vec!["format", "render"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sampling_and_subscribe() {
        let monitor = CpuMonitor::new(CpuConfig {
            sample_interval: Duration::from_millis(100),
            probe_iterations: 1_000,
            calibration_samples: 1,
            ..Default::default()
        });
        let mut rx = monitor.subscribe();

        assert!(monitor.start());
        assert!(!monitor.start());
        let first = rx.recv().await.unwrap();
        assert!((0.0..=100.0).contains(&first.usage));

        tokio::time::sleep(Duration::from_millis(350)).await;
        monitor.stop();
        assert!(!monitor.is_running());
        let samples = monitor.history().len();
        assert!(samples >= 3);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(monitor.history().len(), samples);
    }

    #[test]
    fn test_reset() {
        let monitor = CpuMonitor::default();
        monitor.set_baseline(Duration::from_millis(1));
        monitor.record_call("x", Duration::from_millis(1));
        monitor.reset();
        assert!(monitor.baseline().is_none());
        assert!(monitor.function("x").is_none());
    }

    #[test]
    fn test_average_survives_huge_call_counts() {
        let stats = FunctionStats {
            name: "hot".to_owned(),
            calls: 1 << 32,
            total: Duration::from_secs(1 << 32),
            min: Duration::from_secs(1),
            max: Duration::from_secs(1),
        };
        assert_eq!(stats.average(), Duration::from_secs(1));

        assert_eq!(FunctionStats::new("cold").average(), Duration::ZERO);
    }
}
