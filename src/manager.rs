//! The top-level handle that owns every monitor and wires their samples into
//! the alert rules.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::alert::{AlertId, AlertSystem, MetricSample, NoopNotifier, Notifier};
use crate::cache::RequestCache;
use crate::concurrency::ConcurrencyManager;
use crate::config::Config;
use crate::core::{duration_ms, lock};
use crate::logger::Logger;
use crate::monitor::{CpuMonitor, HeapProbe, MemoryMonitor, PerformanceMonitor, UnsupportedProbe};
use crate::persist::{DurabilitySink, NoopSink};
use crate::profiler::ComponentProfiler;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How often fresh samples are run through the alert rules.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Run the attached cache's expiry sweeper while started.
    pub sweep_cache: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            sweep_cache: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub cpu: bool,
    pub memory: bool,
    /// `false` once the heap probe reported the host unsupported.
    pub memory_supported: bool,
    pub performance: bool,
    pub active_alerts: usize,
    pub components: usize,
}

#[derive(Default)]
pub struct ManagerBuilder {
    config: Config,
    probe: Option<Arc<dyn HeapProbe>>,
    notifier: Option<Arc<dyn Notifier>>,
    sink: Option<Arc<dyn DurabilitySink>>,
    concurrency: Option<ConcurrencyManager>,
    cache: Option<RequestCache>,
}

impl ManagerBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Defaults to the process probe when the `system` feature is on.
    pub fn heap_probe(mut self, probe: Arc<dyn HeapProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DurabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Includes the manager's task metrics in performance snapshots.
    pub fn concurrency(mut self, concurrency: ConcurrencyManager) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Includes the cache's metrics in performance snapshots.
    pub fn cache(mut self, cache: RequestCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> PerformanceManager {
        let Self {
            config,
            probe,
            notifier,
            sink,
            concurrency,
            cache,
        } = self;

        let sink = sink.unwrap_or_else(|| Arc::new(NoopSink));
        let probe = probe.unwrap_or_else(default_probe);
        let notifier = notifier.unwrap_or_else(|| Arc::new(NoopNotifier));

        let logger = Arc::new(Logger::new(config.logger.clone(), sink));
        let alerts = AlertSystem::with_notifier(config.alerts.clone(), notifier);
        let cpu = CpuMonitor::new(config.cpu.clone());
        let memory = MemoryMonitor::new(config.memory.clone(), probe);
        let profiler = ComponentProfiler::with_alerts(config.profiler.clone(), alerts.clone());

        let performance = PerformanceMonitor::new(config.performance.clone(), alerts.clone());
        performance.attach_cpu(cpu.clone());
        performance.attach_memory(memory.clone());
        if let Some(concurrency) = &concurrency {
            performance.attach_concurrency(concurrency.clone());
        }
        if let Some(cache) = &cache {
            performance.attach_cache(cache.clone());
        }

        PerformanceManager {
            inner: Arc::new(ManagerInner {
                config,
                logger,
                alerts,
                cpu,
                memory,
                performance,
                profiler,
                concurrency,
                cache,
                seen: Mutex::default(),
                task: Mutex::new(None),
            }),
        }
    }
}

#[cfg(feature = "system")]
fn default_probe() -> Arc<dyn HeapProbe> {
    match crate::monitor::SystemHeapProbe::new() {
        Ok(probe) => Arc::new(probe),
        Err(err) => {
            tracing::info!("process memory is not observable: {err}");
            Arc::new(UnsupportedProbe)
        }
    }
}

#[cfg(not(feature = "system"))]
fn default_probe() -> Arc<dyn HeapProbe> {
    Arc::new(UnsupportedProbe)
}

/// Timestamps of the samples already run through the rules.
#[derive(Default)]
struct Seen {
    cpu: Option<Instant>,
    memory: Option<Instant>,
    performance: Option<Instant>,
}

struct ManagerInner {
    config: Config,
    logger: Arc<Logger>,
    alerts: AlertSystem,
    cpu: CpuMonitor,
    memory: MemoryMonitor,
    performance: PerformanceMonitor,
    profiler: ComponentProfiler,
    concurrency: Option<ConcurrencyManager>,
    cache: Option<RequestCache>,
    seen: Mutex<Seen>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

/// Owns the monitors, the profiler, the alert system and the logger.
///
/// Nothing here is global: build as many independent managers as needed.
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct PerformanceManager {
    inner: Arc<ManagerInner>,
}

impl PerformanceManager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Starts every monitor and the rule poll loop. Returns `false` if
    /// already running.
    pub fn start(&self) -> bool {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        self.inner.cpu.start();
        self.inner.memory.start();
        self.inner.performance.start();
        if self.inner.config.manager.sweep_cache {
            if let Some(cache) = &self.inner.cache {
                cache.start_sweeper();
            }
        }
        self.inner.logger.start_auto_flush();

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.manager.poll_interval;
        *task = Some(tokio::spawn(poll_loop(weak, period)));

        self.inner.logger.info(
            "performance manager started",
            json!({ "poll_interval_ms": period.as_millis() as u64 }),
        );
        true
    }

    /// Stops every loop and flushes the logger.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.task).take() {
            handle.abort();
        }

        self.inner.cpu.stop();
        self.inner.memory.stop();
        self.inner.performance.stop();
        if let Some(cache) = &self.inner.cache {
            cache.stop_sweeper();
        }

        self.inner.logger.info("performance manager stopped", json!({}));
        self.inner.logger.stop_auto_flush();
    }

    pub fn restart(&self) -> bool {
        self.stop();
        self.start()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            running: self.is_running(),
            cpu: self.inner.cpu.is_running(),
            memory: self.inner.memory.is_running(),
            memory_supported: self.inner.memory.is_supported(),
            performance: self.inner.performance.is_running(),
            active_alerts: self.inner.alerts.active_alerts().len(),
            components: self.inner.profiler.components().len(),
        }
    }

    /// Runs samples that arrived since the last poll through the alert
    /// rules and logs every alert that fired.
    pub fn poll(&self) -> Vec<AlertId> {
        let inner = &self.inner;

        let (cpu, memory, performance) = {
            let mut seen = lock(&inner.seen);
            (
                fresh(&mut seen.cpu, inner.cpu.current(), |sample| sample.at),
                fresh(&mut seen.memory, inner.memory.current(), |sample| sample.at),
                fresh(&mut seen.performance, inner.performance.latest(), |sample| sample.at),
            )
        };

        let mut fired = Vec::new();
        if let Some(cpu) = cpu {
            fired.extend(inner.alerts.check_rules(&MetricSample::Cpu(cpu), "cpu-monitor"));
        }
        if let Some(memory) = memory {
            fired.extend(inner.alerts.check_rules(&MetricSample::Memory(memory), "memory-monitor"));
        }
        if let Some(performance) = performance {
            fired.extend(inner.alerts.check_rules(&MetricSample::Performance(performance), "performance-monitor"));
        }

        for alert in fired.iter().filter_map(|id| inner.alerts.get(*id)) {
            inner.logger.warn(
                alert.title.clone(),
                json!({
                    "alert": alert.id.to_string(),
                    "severity": alert.severity,
                    "source": alert.source,
                    "value": alert.value,
                    "occurrences": alert.occurrences,
                }),
            );
        }

        fired
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.inner.logger
    }

    pub fn alerts(&self) -> &AlertSystem {
        &self.inner.alerts
    }

    pub fn cpu(&self) -> &CpuMonitor {
        &self.inner.cpu
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.inner.memory
    }

    pub fn performance(&self) -> &PerformanceMonitor {
        &self.inner.performance
    }

    pub fn profiler(&self) -> &ComponentProfiler {
        &self.inner.profiler
    }

    pub fn concurrency(&self) -> Option<&ConcurrencyManager> {
        self.inner.concurrency.as_ref()
    }

    pub fn cache(&self) -> Option<&RequestCache> {
        self.inner.cache.as_ref()
    }
}

impl std::fmt::Debug for PerformanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceManager")
            .field("status", &self.status())
            .finish()
    }
}

/// Passes `sample` through unless it is the one seen last time.
fn fresh<T>(seen: &mut Option<Instant>, sample: Option<T>, at: impl Fn(&T) -> Instant) -> Option<T> {
    let sample = sample?;
    let stamp = at(&sample);
    if *seen == Some(stamp) {
        return None;
    }
    *seen = Some(stamp);
    Some(sample)
}

async fn poll_loop(weak: Weak<ManagerInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        PerformanceManager { inner }.poll();
    }
}
