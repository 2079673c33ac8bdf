use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::{duration_ms, lock};
use crate::history::RollingHistory;
use crate::monitor::leak::{LeakAssessment, LeakDetector, LeakThresholds, MemoryReading};
use crate::monitor::probe::{HeapProbe, HeapStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    #[serde(with = "duration_ms")]
    pub sample_interval: Duration,
    pub history_size: usize,
    pub warning_percent: f64,
    pub critical_percent: f64,
    /// Readings compared to classify the trend.
    pub trend_window: usize,
    /// Relative change across the trend window treated as movement.
    pub trend_tolerance: f64,
    pub leak: LeakThresholds,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            history_size: 100,
            warning_percent: 70.0,
            critical_percent: 90.0,
            trend_window: 5,
            trend_tolerance: 0.05,
            leak: LeakThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTrend {
    Increasing,
    Stable,
    Decreasing,
}

/// One heap reading and what was concluded from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySample {
    pub heap: HeapStats,
    pub usage_percent: f64,
    pub pressure: MemoryPressure,
    pub trend: MemoryTrend,
    /// Absent until the history holds two readings.
    pub leak: Option<LeakAssessment>,
    #[serde(skip)]
    pub at: Instant,
}

impl MemorySample {
    pub fn is_leak(&self) -> bool {
        self.leak.as_ref().is_some_and(LeakAssessment::is_leak)
    }
}

struct MemoryInner {
    config: MemoryConfig,
    probe: Arc<dyn HeapProbe>,
    detector: LeakDetector,
    history: Mutex<RollingHistory<MemorySample>>,
    supported: AtomicBool,
    tx: broadcast::Sender<MemorySample>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

/// Samples the heap on an interval and watches for sustained growth.
///
/// If the probe reports no heap introspection, the monitor switches itself
/// off after logging that once.
#[derive(Clone)]
pub struct MemoryMonitor {
    inner: Arc<MemoryInner>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryConfig, probe: Arc<dyn HeapProbe>) -> Self {
        let (tx, _) = broadcast::channel(64);
        let detector = LeakDetector::new(config.leak.clone());
        let history = RollingHistory::new(config.history_size);
        Self {
            inner: Arc::new(MemoryInner {
                config,
                probe,
                detector,
                history: Mutex::new(history),
                supported: AtomicBool::new(true),
                tx,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    /// `false` once the probe reported that the host has no heap API.
    pub fn is_supported(&self) -> bool {
        self.inner.supported.load(Ordering::Relaxed)
    }

    /// Starts periodic sampling. Returns `false` if already running or the
    /// host is unsupported.
    pub fn start(&self) -> bool {
        if !self.is_supported() {
            return false;
        }

        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sample_interval;
        *task = Some(tokio::spawn(sample_loop(weak, period)));
        tracing::debug!(?period, "memory monitor started");
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.task).take() {
            handle.abort();
            tracing::debug!("memory monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Reads the probe once. Returns `None` when the host is unsupported or
    /// the probe failed; neither is an error for the caller.
    pub fn sample_now(&self) -> Option<MemorySample> {
        if !self.is_supported() {
            return None;
        }

        let heap = match self.inner.probe.sample() {
            Ok(Some(heap)) => heap,
            Ok(None) => {
                if self.inner.supported.swap(false, Ordering::Relaxed) {
                    tracing::info!("heap introspection is not available, memory monitoring disabled");
                }
                return None;
            }
            Err(err) => {
                tracing::warn!("couldn't read heap statistics: {err}");
                return None;
            }
        };

        Some(self.record(heap))
    }

    /// Records a reading taken elsewhere.
    pub fn record(&self, heap: HeapStats) -> MemorySample {
        let config = &self.inner.config;
        let now = Instant::now();

        let sample = {
            let mut history = lock(&self.inner.history);

            let mut readings: Vec<MemoryReading> = history
                .window(config.leak.window.max(config.trend_window))
                .map(|sample| MemoryReading {
                    at: sample.at,
                    heap: sample.heap,
                })
                .collect();
            readings.push(MemoryReading { at: now, heap });

            let usage_percent = heap.usage_percent();
            let sample = MemorySample {
                heap,
                usage_percent,
                pressure: pressure(usage_percent, config),
                trend: trend(&readings, config),
                leak: self.inner.detector.assess(&readings),
                at: now,
            };
            history.push(sample.clone());
            sample
        };

        if sample.is_leak() {
            tracing::warn!(
                usage = sample.usage_percent,
                growth_rate = sample.leak.as_ref().map(|l| l.growth_rate),
                "sustained heap growth, possible memory leak"
            );
        }

        let _ = self.inner.tx.send(sample.clone());
        sample
    }

    pub fn current(&self) -> Option<MemorySample> {
        lock(&self.inner.history).latest().cloned()
    }

    pub fn history(&self) -> Vec<MemorySample> {
        lock(&self.inner.history).to_vec()
    }

    pub fn trend(&self) -> Option<MemoryTrend> {
        self.current().map(|sample| sample.trend)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemorySample> {
        self.inner.tx.subscribe()
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("config", &self.inner.config)
            .field("supported", &self.is_supported())
            .field("running", &self.is_running())
            .finish()
    }
}

fn pressure(usage_percent: f64, config: &MemoryConfig) -> MemoryPressure {
    if usage_percent >= config.critical_percent {
        MemoryPressure::Critical
    } else if usage_percent >= config.warning_percent {
        MemoryPressure::Warning
    } else {
        MemoryPressure::Normal
    }
}

fn trend(readings: &[MemoryReading], config: &MemoryConfig) -> MemoryTrend {
    let start = readings.len().saturating_sub(config.trend_window.max(2));
    let window = &readings[start..];

    let (first, last) = match window {
        [first, .., last] => (first.heap.used as f64, last.heap.used as f64),
        _ => return MemoryTrend::Stable,
    };

    if first == 0.0 {
        return if last > 0.0 {
            MemoryTrend::Increasing
        } else {
            MemoryTrend::Stable
        };
    }

    let change = (last - first) / first;
    if change > config.trend_tolerance {
        MemoryTrend::Increasing
    } else if change < -config.trend_tolerance {
        MemoryTrend::Decreasing
    } else {
        MemoryTrend::Stable
    }
}

async fn sample_loop(weak: Weak<MemoryInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let monitor = MemoryMonitor { inner };
        monitor.sample_now();
        if !monitor.is_supported() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::probe::{ScriptedHeapProbe, StaticHeapProbe, UnsupportedProbe};

    const MB: u64 = 1024 * 1024;

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_host_disables_monitor() {
        let monitor = MemoryMonitor::new(MemoryConfig::default(), Arc::new(UnsupportedProbe));
        assert!(monitor.is_supported());
        assert!(monitor.start());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.is_supported());
        assert!(monitor.sample_now().is_none());
        assert!(!monitor.start());
        assert!(monitor.history().is_empty());
    }

    #[test]
    fn test_probe_errors_are_swallowed() {
        let probe = Arc::new(ScriptedHeapProbe::default());
        probe.push_error("heap api threw");
        probe.push(HeapStats::new(10 * MB, 20 * MB, 100 * MB));

        let monitor = MemoryMonitor::new(MemoryConfig::default(), probe);
        assert!(monitor.sample_now().is_none());
        assert!(monitor.is_supported());

        let sample = monitor.sample_now().unwrap();
        assert_eq!(sample.usage_percent, 10.0);
        assert_eq!(sample.pressure, MemoryPressure::Normal);
        assert!(sample.leak.is_none());
    }

    #[test]
    fn test_pressure_levels() {
        let config = MemoryConfig::default();
        assert_eq!(pressure(50.0, &config), MemoryPressure::Normal);
        assert_eq!(pressure(70.0, &config), MemoryPressure::Warning);
        assert_eq!(pressure(95.0, &config), MemoryPressure::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trend_follows_readings() {
        let monitor = MemoryMonitor::new(
            MemoryConfig::default(),
            Arc::new(StaticHeapProbe(HeapStats::new(0, 0, 0))),
        );

        for used in [100, 101, 100, 101] {
            monitor.record(HeapStats::new(used * MB, used * MB, 1000 * MB));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(monitor.trend(), Some(MemoryTrend::Stable));

        for used in [120, 140, 160, 180, 200] {
            monitor.record(HeapStats::new(used * MB, used * MB, 1000 * MB));
        }
        assert_eq!(monitor.trend(), Some(MemoryTrend::Increasing));

        for used in [150, 100, 60, 30, 10] {
            monitor.record(HeapStats::new(used * MB, used * MB, 1000 * MB));
        }
        assert_eq!(monitor.trend(), Some(MemoryTrend::Decreasing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_growth_is_flagged() {
        // 2 MiB every 5 s, ending at 78% of the limit
        let limit = 100 * MB;
        let readings = (0..10).map(|i| HeapStats::new((60 + 2 * i) * MB, (60 + 2 * i) * MB, limit));
        let probe = Arc::new(ScriptedHeapProbe::new(readings));

        let monitor = MemoryMonitor::new(
            MemoryConfig {
                sample_interval: Duration::from_secs(5),
                ..Default::default()
            },
            probe,
        );
        let mut rx = monitor.subscribe();
        assert!(monitor.start());

        let mut last = None;
        for _ in 0..10 {
            last = Some(rx.recv().await.unwrap());
        }
        monitor.stop();

        let last = last.unwrap();
        assert!(last.is_leak());
        assert_eq!(last.trend, MemoryTrend::Increasing);
        assert_eq!(monitor.history().len(), 10);
    }
}
