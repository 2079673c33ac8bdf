//! Periodic snapshots across every attached monitor, checked against
//! warning and critical thresholds.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::alert::{AlertDraft, AlertSystem, MetricKind, MetricSample, Severity, derive_severity};
use crate::cache::{CacheMetrics, RequestCache};
use crate::concurrency::{ConcurrencyManager, ConcurrencyMetrics};
use crate::core::{duration_ms, lock};
use crate::history::RollingHistory;
use crate::monitor::cpu::{CpuMonitor, CpuUsageData, LongTask};
use crate::monitor::memory::{MemoryMonitor, MemorySample};
use crate::monitor::vitals::{Rating, Vital, VitalReport, WebVitals};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    /// The alert severity once `value` reaches the warning level.
    pub fn breach(&self, value: f64) -> Option<Severity> {
        (value >= self.warning).then(|| derive_severity(value, self.warning, self.critical))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    /// Percent.
    pub cpu_usage: Threshold,
    /// Percent of the heap limit.
    pub memory_usage: Threshold,
    /// Share of settled tasks, `0.0..=1.0`.
    pub task_error_rate: Threshold,
    pub lcp: Threshold,
    pub fcp: Threshold,
    pub cls: Threshold,
    pub ttfb: Threshold,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            cpu_usage: Threshold::new(70.0, 90.0),
            memory_usage: Threshold::new(70.0, 90.0),
            task_error_rate: Threshold::new(0.1, 0.25),
            lcp: Threshold::new(4000.0, 6000.0),
            fcp: Threshold::new(3000.0, 4500.0),
            cls: Threshold::new(0.25, 0.5),
            ttfb: Threshold::new(1800.0, 3000.0),
        }
    }
}

impl PerformanceThresholds {
    pub fn vital(&self, vital: Vital) -> Threshold {
        match vital {
            Vital::Lcp => self.lcp,
            Vital::Fcp => self.fcp,
            Vital::Cls => self.cls,
            Vital::Ttfb => self.ttfb,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    #[serde(with = "duration_ms")]
    pub collect_interval: Duration,
    pub history_size: usize,
    pub thresholds: PerformanceThresholds,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(10),
            history_size: 100,
            thresholds: PerformanceThresholds::default(),
        }
    }
}

/// Everything known about the process at one instant. Sources that were
/// never attached, or have not reported yet, are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub cpu: Option<CpuUsageData>,
    pub memory: Option<MemorySample>,
    pub vitals: WebVitals,
    pub long_tasks: usize,
    pub concurrency: Option<ConcurrencyMetrics>,
    pub cache: Option<CacheMetrics>,
    #[serde(skip)]
    pub at: Instant,
}

#[derive(Clone, Default)]
struct Sources {
    cpu: Option<CpuMonitor>,
    memory: Option<MemoryMonitor>,
    concurrency: Option<ConcurrencyManager>,
    cache: Option<RequestCache>,
}

struct PerformanceInner {
    config: PerformanceConfig,
    alerts: AlertSystem,
    sources: Mutex<Sources>,
    vitals: Mutex<WebVitals>,
    history: Mutex<RollingHistory<PerformanceSnapshot>>,
    tx: broadcast::Sender<PerformanceSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PerformanceInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<PerformanceInner>,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig, alerts: AlertSystem) -> Self {
        let (tx, _) = broadcast::channel(64);
        let history = RollingHistory::new(config.history_size);
        Self {
            inner: Arc::new(PerformanceInner {
                config,
                alerts,
                sources: Mutex::default(),
                vitals: Mutex::default(),
                history: Mutex::new(history),
                tx,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.inner.config
    }

    pub fn alerts(&self) -> &AlertSystem {
        &self.inner.alerts
    }

    pub fn attach_cpu(&self, cpu: CpuMonitor) {
        lock(&self.inner.sources).cpu = Some(cpu);
    }

    pub fn attach_memory(&self, memory: MemoryMonitor) {
        lock(&self.inner.sources).memory = Some(memory);
    }

    pub fn attach_concurrency(&self, concurrency: ConcurrencyManager) {
        lock(&self.inner.sources).concurrency = Some(concurrency);
    }

    pub fn attach_cache(&self, cache: RequestCache) {
        lock(&self.inner.sources).cache = Some(cache);
    }

    /// Web Vitals callback. Each vital may arrive on its own, in any order.
    pub fn report_vital(&self, vital: Vital, value: f64) -> VitalReport {
        let report = VitalReport::new(vital, value);
        lock(&self.inner.vitals).record(report);

        if report.rating != Rating::Good {
            let threshold = self.inner.config.thresholds.vital(vital);
            let severity = derive_severity(value, threshold.warning, threshold.critical);
            self.inner.alerts.raise(
                AlertDraft::new(MetricKind::Vitals, format!("vital:{vital}"), format!("{vital} needs attention"))
                    .severity(severity)
                    .message(format!("{vital} measured {value} and is rated {:?}", report.rating))
                    .source("web-vitals")
                    .value(value),
            );
        }

        self.inner.alerts.check_rules(&MetricSample::Vitals(report), "web-vitals");
        report
    }

    pub fn vitals(&self) -> WebVitals {
        *lock(&self.inner.vitals)
    }

    /// Forwards a long task to the attached CPU monitor.
    pub fn record_long_task(&self, task: LongTask) -> bool {
        let cpu = lock(&self.inner.sources).cpu.clone();
        cpu.is_some_and(|cpu| cpu.record_long_task(task))
    }

    /// Builds a snapshot from the attached sources, records it, and raises
    /// threshold alerts.
    pub fn collect(&self) -> PerformanceSnapshot {
        let sources = lock(&self.inner.sources).clone();

        let snapshot = PerformanceSnapshot {
            cpu: sources.cpu.as_ref().and_then(CpuMonitor::current),
            memory: sources.memory.as_ref().and_then(MemoryMonitor::current),
            vitals: self.vitals(),
            long_tasks: sources.cpu.as_ref().map_or(0, CpuMonitor::long_task_count),
            concurrency: sources.concurrency.as_ref().map(ConcurrencyManager::metrics),
            cache: sources.cache.as_ref().map(RequestCache::metrics),
            at: Instant::now(),
        };

        lock(&self.inner.history).push(snapshot.clone());
        self.check_thresholds(&snapshot);

        let _ = self.inner.tx.send(snapshot.clone());
        snapshot
    }

    fn check_thresholds(&self, snapshot: &PerformanceSnapshot) {
        let thresholds = &self.inner.config.thresholds;

        if let Some(cpu) = &snapshot.cpu {
            self.breach(MetricKind::Cpu, "cpu", "High CPU usage", cpu.usage, thresholds.cpu_usage, "%");
        }
        if let Some(memory) = &snapshot.memory {
            self.breach(
                MetricKind::Memory,
                "memory",
                "High memory usage",
                memory.usage_percent,
                thresholds.memory_usage,
                "%",
            );
        }
        if let Some(tasks) = &snapshot.concurrency {
            self.breach(
                MetricKind::Performance,
                "task-error-rate",
                "Tasks are failing",
                tasks.error_rate,
                thresholds.task_error_rate,
                "",
            );
        }
    }

    fn breach(&self, kind: MetricKind, metric: &str, title: &str, value: f64, threshold: Threshold, unit: &str) {
        let Some(severity) = threshold.breach(value) else {
            return;
        };

        self.inner.alerts.raise(
            AlertDraft::new(kind, format!("threshold:{metric}"), title)
                .severity(severity)
                .message(format!(
                    "{metric} at {value:.2}{unit} (warning {}{unit}, critical {}{unit})",
                    threshold.warning, threshold.critical
                ))
                .source("performance-monitor")
                .value(value),
        );
    }

    /// Starts periodic collection. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.collect_interval;
        *task = Some(tokio::spawn(collect_loop(weak, period)));
        tracing::debug!(?period, "performance monitor started");
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.task).take() {
            handle.abort();
            tracing::debug!("performance monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn latest(&self) -> Option<PerformanceSnapshot> {
        lock(&self.inner.history).latest().cloned()
    }

    pub fn history(&self) -> Vec<PerformanceSnapshot> {
        lock(&self.inner.history).to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PerformanceSnapshot> {
        self.inner.tx.subscribe()
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn collect_loop(weak: Weak<PerformanceInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        PerformanceMonitor { inner }.collect();
    }
}
