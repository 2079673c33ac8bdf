//! Render cost and render frequency per named UI component.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::alert::{AlertDraft, AlertSystem, MetricKind, MetricSample, Severity};
use crate::core::{duration_ms, fmt_ms, lock};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    #[serde(with = "duration_ms")]
    pub slow_render: Duration,
    #[serde(with = "duration_ms")]
    pub very_slow_render: Duration,
    /// More renders than this within `storm_window` is a re-render storm.
    pub storm_render_count: usize,
    #[serde(with = "duration_ms")]
    pub storm_window: Duration,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            slow_render: Duration::from_millis(16),
            very_slow_render: Duration::from_millis(50),
            storm_render_count: 20,
            storm_window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderPhase {
    Mount,
    Update,
    NestedUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentPerformanceData {
    pub name: String,
    pub render_count: u64,
    #[serde(with = "duration_ms")]
    pub total_render_time: Duration,
    #[serde(with = "duration_ms")]
    pub average_render_time: Duration,
    #[serde(with = "duration_ms")]
    pub min_render_time: Duration,
    #[serde(with = "duration_ms")]
    pub max_render_time: Duration,
    #[serde(with = "duration_ms")]
    pub last_render_time: Duration,
    pub last_phase: RenderPhase,
    pub slow_renders: u64,
}

impl ComponentPerformanceData {
    fn new(name: &str, phase: RenderPhase) -> Self {
        Self {
            name: name.to_owned(),
            render_count: 0,
            total_render_time: Duration::ZERO,
            average_render_time: Duration::ZERO,
            min_render_time: Duration::MAX,
            max_render_time: Duration::ZERO,
            last_render_time: Duration::ZERO,
            last_phase: phase,
            slow_renders: 0,
        }
    }

    fn observe(&mut self, phase: RenderPhase, duration: Duration) {
        self.render_count += 1;
        self.total_render_time += duration;
        self.average_render_time = self.total_render_time / self.render_count.min(u32::MAX as u64) as u32;
        self.min_render_time = self.min_render_time.min(duration);
        self.max_render_time = self.max_render_time.max(duration);
        self.last_render_time = duration;
        self.last_phase = phase;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProfilerEvent {
    SlowRender {
        component: String,
        #[serde(with = "duration_ms")]
        duration: Duration,
        severity: Severity,
    },
    /// Reported at most once per storm window.
    RenderStorm {
        component: String,
        renders: usize,
        #[serde(with = "duration_ms")]
        window: Duration,
    },
}

struct Track {
    data: ComponentPerformanceData,
    recent: VecDeque<Instant>,
    storm_reported: Option<Instant>,
}

struct ProfilerInner {
    config: ProfilerConfig,
    alerts: Option<AlertSystem>,
    tracks: Mutex<HashMap<String, Track>>,
    tx: broadcast::Sender<ProfilerEvent>,
}

#[derive(Clone)]
pub struct ComponentProfiler {
    inner: Arc<ProfilerInner>,
}

impl ComponentProfiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Self::build(config, None)
    }

    /// A profiler that also raises alerts and runs component rules.
    pub fn with_alerts(config: ProfilerConfig, alerts: AlertSystem) -> Self {
        Self::build(config, Some(alerts))
    }

    fn build(config: ProfilerConfig, alerts: Option<AlertSystem>) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ProfilerInner {
                config,
                alerts,
                tracks: Mutex::default(),
                tx,
            }),
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.inner.config
    }

    /// Records one render of `component`. A mount restarts the storm window.
    pub fn record_render(&self, component: &str, phase: RenderPhase, duration: Duration) -> Vec<ProfilerEvent> {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut events = Vec::new();

        let data = {
            let mut tracks = lock(&self.inner.tracks);
            let track = tracks.entry(component.to_owned()).or_insert_with(|| Track {
                data: ComponentPerformanceData::new(component, phase),
                recent: VecDeque::new(),
                storm_reported: None,
            });

            track.data.observe(phase, duration);

            if duration > config.slow_render {
                track.data.slow_renders += 1;
                let severity = if duration > config.very_slow_render {
                    Severity::High
                } else {
                    Severity::Medium
                };
                events.push(ProfilerEvent::SlowRender {
                    component: component.to_owned(),
                    duration,
                    severity,
                });
            }

            if phase == RenderPhase::Mount {
                track.recent.clear();
                track.storm_reported = None;
            }
            track.recent.push_back(now);
            while track
                .recent
                .front()
                .is_some_and(|at| now.saturating_duration_since(*at) > config.storm_window)
            {
                track.recent.pop_front();
            }

            let reported = track
                .storm_reported
                .is_some_and(|at| now.saturating_duration_since(at) < config.storm_window);
            if track.recent.len() > config.storm_render_count && !reported {
                track.storm_reported = Some(now);
                events.push(ProfilerEvent::RenderStorm {
                    component: component.to_owned(),
                    renders: track.recent.len(),
                    window: config.storm_window,
                });
            }

            track.data.clone()
        };

        for event in &events {
            match event {
                ProfilerEvent::SlowRender { duration, .. } => {
                    tracing::debug!(component, duration = %fmt_ms(*duration), "slow render");
                }
                ProfilerEvent::RenderStorm { renders, .. } => {
                    tracing::warn!(component, renders = *renders, "re-render storm");
                }
            }
            let _ = self.inner.tx.send(event.clone());
        }

        if let Some(alerts) = &self.inner.alerts {
            for event in &events {
                alerts.raise(alert_for(event));
            }
            alerts.check_rules(&MetricSample::Component(data), "component-profiler");
        }

        events
    }

    /// Starts timing a render; the render is recorded when the timer is
    /// finished or dropped.
    pub fn start_render(&self, component: impl Into<String>, phase: RenderPhase) -> RenderTimer {
        RenderTimer {
            profiler: self.clone(),
            component: component.into(),
            phase,
            started: Instant::now(),
            done: false,
        }
    }

    pub fn component(&self, name: &str) -> Option<ComponentPerformanceData> {
        lock(&self.inner.tracks).get(name).map(|track| track.data.clone())
    }

    /// Every tracked component, by name.
    pub fn components(&self) -> Vec<ComponentPerformanceData> {
        let mut components: Vec<_> = lock(&self.inner.tracks)
            .values()
            .map(|track| track.data.clone())
            .collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));
        components
    }

    /// The `n` components with the highest average render time.
    pub fn slowest(&self, n: usize) -> Vec<ComponentPerformanceData> {
        let mut components = self.components();
        components.sort_by(|a, b| b.average_render_time.cmp(&a.average_render_time));
        components.truncate(n);
        components
    }

    pub fn clear(&self) {
        lock(&self.inner.tracks).clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProfilerEvent> {
        self.inner.tx.subscribe()
    }
}

impl Default for ComponentProfiler {
    fn default() -> Self {
        Self::new(ProfilerConfig::default())
    }
}

impl std::fmt::Debug for ComponentProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentProfiler")
            .field("config", &self.inner.config)
            .field("components", &lock(&self.inner.tracks).len())
            .finish()
    }
}

fn alert_for(event: &ProfilerEvent) -> AlertDraft {
    let draft = match event {
        ProfilerEvent::SlowRender {
            component,
            duration,
            severity,
        } => AlertDraft::new(MetricKind::Component, format!("render:slow:{component}"), "Slow render")
            .severity(*severity)
            .message(format!("{component} took {} to render", fmt_ms(*duration)))
            .value(duration.as_secs_f64() * 1000.0),
        ProfilerEvent::RenderStorm {
            component,
            renders,
            window,
        } => AlertDraft::new(MetricKind::Component, format!("render:storm:{component}"), "Re-render storm")
            .severity(Severity::Medium)
            .message(format!("{component} rendered {renders} times within {}", fmt_ms(*window)))
            .value(*renders as f64),
    };
    draft.source("component-profiler")
}

/// Times one render. See [`ComponentProfiler::start_render`].
#[must_use = "dropping the timer records the render immediately"]
pub struct RenderTimer {
    profiler: ComponentProfiler,
    component: String,
    phase: RenderPhase,
    started: Instant,
    done: bool,
}

impl RenderTimer {
    pub fn finish(mut self) -> Vec<ProfilerEvent> {
        self.done = true;
        let elapsed = self.started.elapsed();
        self.profiler.record_render(&self.component, self.phase, elapsed)
    }
}

impl Drop for RenderTimer {
    fn drop(&mut self) {
        if !self.done {
            self.profiler
                .record_render(&self.component, self.phase, self.started.elapsed());
        }
    }
}
