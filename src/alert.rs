//! Rule-based alerting.
//!
//! Rules are typed predicates over one kind of metric sample. A rule that
//! fired less than its cooldown ago is skipped outright. Raised alerts are
//! deduplicated by key while unresolved, capped in number, and, if enabled,
//! resolve on their own once nothing has touched them for a while.

mod notify;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::{duration_ms, lock};
use crate::monitor::{CpuUsageData, MemoryPressure, MemorySample, PerformanceSnapshot, Rating, VitalReport};
use crate::profiler::ComponentPerformanceData;

pub use notify::{NoopNotifier, NotificationPermission, Notifier, TracingNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Severity of a value measured against a warning and a critical threshold.
/// Values under both thresholds default to `Medium`.
pub fn derive_severity(value: f64, warning: f64, critical: f64) -> Severity {
    if value >= critical {
        Severity::Critical
    } else if value >= warning {
        Severity::High
    } else {
        Severity::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
    Component,
    Vitals,
    Performance,
}

/// A metric sample handed to the rules.
#[derive(Debug, Clone)]
pub enum MetricSample {
    Cpu(CpuUsageData),
    Memory(MemorySample),
    Component(ComponentPerformanceData),
    Vitals(VitalReport),
    Performance(PerformanceSnapshot),
}

impl MetricSample {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSample::Cpu(_) => MetricKind::Cpu,
            MetricSample::Memory(_) => MetricKind::Memory,
            MetricSample::Component(_) => MetricKind::Component,
            MetricSample::Vitals(_) => MetricKind::Vitals,
            MetricSample::Performance(_) => MetricKind::Performance,
        }
    }

    /// The headline figure attached to alerts raised from this sample.
    pub fn value(&self) -> Option<f64> {
        match self {
            MetricSample::Cpu(cpu) => Some(cpu.usage),
            MetricSample::Memory(memory) => Some(memory.usage_percent),
            MetricSample::Component(component) => Some(component.average_render_time.as_secs_f64() * 1000.0),
            MetricSample::Vitals(report) => Some(report.value),
            MetricSample::Performance(_) => None,
        }
    }
}

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A rule predicate, typed against the one kind of sample it understands.
#[derive(Clone)]
pub enum Condition {
    Cpu(Predicate<CpuUsageData>),
    Memory(Predicate<MemorySample>),
    Component(Predicate<ComponentPerformanceData>),
    Vitals(Predicate<VitalReport>),
    Performance(Predicate<PerformanceSnapshot>),
}

impl Condition {
    pub fn kind(&self) -> MetricKind {
        match self {
            Condition::Cpu(_) => MetricKind::Cpu,
            Condition::Memory(_) => MetricKind::Memory,
            Condition::Component(_) => MetricKind::Component,
            Condition::Vitals(_) => MetricKind::Vitals,
            Condition::Performance(_) => MetricKind::Performance,
        }
    }

    /// A sample of another kind never matches.
    pub fn matches(&self, sample: &MetricSample) -> bool {
        match (self, sample) {
            (Condition::Cpu(predicate), MetricSample::Cpu(data)) => predicate(data),
            (Condition::Memory(predicate), MetricSample::Memory(data)) => predicate(data),
            (Condition::Component(predicate), MetricSample::Component(data)) => predicate(data),
            (Condition::Vitals(predicate), MetricSample::Vitals(data)) => predicate(data),
            (Condition::Performance(predicate), MetricSample::Performance(data)) => predicate(data),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Condition::{:?}", self.kind())
    }
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    /// Falls back to [`AlertConfig::default_cooldown`].
    pub cooldown: Option<Duration>,
    pub enabled: bool,
    condition: Condition,
    last_triggered: Option<Instant>,
}

impl AlertRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, severity: Severity, condition: Condition) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            severity,
            cooldown: None,
            enabled: true,
            condition,
            last_triggered: None,
        }
    }

    pub fn cpu<F>(id: impl Into<String>, name: impl Into<String>, severity: Severity, predicate: F) -> Self
    where
        F: Fn(&CpuUsageData) -> bool + Send + Sync + 'static,
    {
        Self::new(id, name, severity, Condition::Cpu(Arc::new(predicate)))
    }

    pub fn memory<F>(id: impl Into<String>, name: impl Into<String>, severity: Severity, predicate: F) -> Self
    where
        F: Fn(&MemorySample) -> bool + Send + Sync + 'static,
    {
        Self::new(id, name, severity, Condition::Memory(Arc::new(predicate)))
    }

    pub fn component<F>(id: impl Into<String>, name: impl Into<String>, severity: Severity, predicate: F) -> Self
    where
        F: Fn(&ComponentPerformanceData) -> bool + Send + Sync + 'static,
    {
        Self::new(id, name, severity, Condition::Component(Arc::new(predicate)))
    }

    pub fn vitals<F>(id: impl Into<String>, name: impl Into<String>, severity: Severity, predicate: F) -> Self
    where
        F: Fn(&VitalReport) -> bool + Send + Sync + 'static,
    {
        Self::new(id, name, severity, Condition::Vitals(Arc::new(predicate)))
    }

    pub fn performance<F>(id: impl Into<String>, name: impl Into<String>, severity: Severity, predicate: F) -> Self
    where
        F: Fn(&PerformanceSnapshot) -> bool + Send + Sync + 'static,
    {
        Self::new(id, name, severity, Condition::Performance(Arc::new(predicate)))
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn kind(&self) -> MetricKind {
        self.condition.kind()
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn last_triggered(&self) -> Option<Instant> {
        self.last_triggered
    }

    fn cooling_down(&self, now: Instant, default: Duration) -> bool {
        let cooldown = self.cooldown.unwrap_or(default);
        self.last_triggered
            .is_some_and(|at| now.saturating_duration_since(at) < cooldown)
    }
}

/// The stock rule set installed unless [`AlertConfig::default_rules`] is off.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::cpu("cpu-high", "High CPU usage", Severity::High, |cpu| cpu.usage > 80.0),
        AlertRule::cpu("cpu-critical", "Critical CPU usage", Severity::Critical, |cpu| cpu.usage > 95.0),
        AlertRule::memory("memory-leak", "Possible memory leak", Severity::Critical, MemorySample::is_leak)
            .cooldown(Duration::from_secs(5 * 60)),
        AlertRule::memory("memory-pressure", "Critical memory pressure", Severity::High, |memory| {
            memory.pressure == MemoryPressure::Critical
        }),
        AlertRule::component("component-very-slow", "Very slow component", Severity::Medium, |component| {
            component.average_render_time > Duration::from_millis(50)
        }),
        AlertRule::vitals("vitals-poor", "Poor Web Vital", Severity::Medium, |report| {
            report.rating == Rating::Poor
        }),
        AlertRule::performance("task-error-rate", "High task error rate", Severity::High, |snapshot| {
            snapshot.concurrency.is_some_and(|tasks| tasks.error_rate > 0.2)
        }),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AlertId(u64);

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "alert-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: AlertId,
    /// Alerts sharing a key are merged while unresolved.
    pub key: String,
    pub rule_id: Option<String>,
    pub kind: MetricKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub source: String,
    pub value: Option<f64>,
    pub status: AlertStatus,
    pub occurrences: u32,
    pub created_at: SystemTime,
    pub last_seen: SystemTime,
    #[serde(skip)]
    touched: Instant,
}

impl Alert {
    pub fn is_resolved(&self) -> bool {
        self.status == AlertStatus::Resolved
    }
}

/// Everything needed to raise an alert directly.
#[derive(Debug, Clone)]
pub struct AlertDraft {
    pub kind: MetricKind,
    pub key: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub source: String,
    pub value: Option<f64>,
    pub rule_id: Option<String>,
}

impl AlertDraft {
    pub fn new(kind: MetricKind, key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            severity: Severity::Medium,
            title: title.into(),
            message: String::new(),
            source: String::new(),
            value: None,
            rule_id: None,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone)]
pub enum AlertEvent {
    Raised(Alert),
    /// An unresolved alert with the same key fired again.
    Repeated(Alert),
    Acknowledged(Alert),
    Resolved(Alert),
}

impl AlertEvent {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertEvent::Raised(alert)
            | AlertEvent::Repeated(alert)
            | AlertEvent::Acknowledged(alert)
            | AlertEvent::Resolved(alert) => alert,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Retained alerts; the oldest are dropped first.
    pub max_alerts: usize,
    pub auto_resolve: bool,
    /// Time without a repeat after which an active alert resolves itself.
    #[serde(with = "duration_ms")]
    pub auto_resolve_after: Duration,
    #[serde(with = "duration_ms")]
    pub default_cooldown: Duration,
    pub default_rules: bool,
    pub notifications: bool,
    pub notify_min_severity: Severity,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_alerts: 100,
            auto_resolve: true,
            auto_resolve_after: Duration::from_secs(5 * 60),
            default_cooldown: Duration::from_secs(60),
            default_rules: true,
            notifications: false,
            notify_min_severity: Severity::High,
        }
    }
}

#[derive(Default)]
struct AlertState {
    rules: Vec<AlertRule>,
    alerts: VecDeque<Alert>,
    timers: HashMap<AlertId, JoinHandle<()>>,
    next_id: u64,
}

struct AlertInner {
    config: AlertConfig,
    notifier: Arc<dyn Notifier>,
    permission: Mutex<Option<NotificationPermission>>,
    state: Mutex<AlertState>,
    tx: broadcast::Sender<AlertEvent>,
}

impl Drop for AlertInner {
    fn drop(&mut self) {
        for (_, timer) in lock(&self.state).timers.drain() {
            timer.abort();
        }
    }
}

#[derive(Clone)]
pub struct AlertSystem {
    inner: Arc<AlertInner>,
}

impl AlertSystem {
    pub fn new(config: AlertConfig) -> Self {
        Self::with_notifier(config, Arc::new(NoopNotifier))
    }

    pub fn with_notifier(config: AlertConfig, notifier: Arc<dyn Notifier>) -> Self {
        let (tx, _) = broadcast::channel(64);
        let state = AlertState {
            rules: if config.default_rules { default_rules() } else { Vec::new() },
            ..Default::default()
        };

        Self {
            inner: Arc::new(AlertInner {
                config,
                notifier,
                permission: Mutex::new(None),
                state: Mutex::new(state),
                tx,
            }),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.inner.config
    }

    /// Runs the enabled rules of the sample's kind against it and raises an
    /// alert for each rule that fires. Returns the ids of those alerts.
    pub fn check_rules(&self, sample: &MetricSample, source: &str) -> Vec<AlertId> {
        let kind = sample.kind();
        let now = Instant::now();
        let cooldown = self.inner.config.default_cooldown;

        let candidates: Vec<AlertRule> = lock(&self.inner.state)
            .rules
            .iter()
            .filter(|rule| rule.enabled && rule.kind() == kind)
            .filter(|rule| !rule.cooling_down(now, cooldown))
            .cloned()
            .collect();

        // Predicates are user code, run them unlocked.
        let matched: Vec<AlertRule> = candidates
            .into_iter()
            .filter(|rule| rule.condition.matches(sample))
            .collect();

        if matched.is_empty() {
            return Vec::new();
        }

        let fired: Vec<AlertRule> = {
            let mut state = lock(&self.inner.state);
            matched
                .into_iter()
                .filter(|rule| {
                    let Some(stored) = state.rules.iter_mut().find(|stored| stored.id == rule.id) else {
                        return false;
                    };
                    if stored.cooling_down(now, cooldown) {
                        return false;
                    }
                    stored.last_triggered = Some(now);
                    true
                })
                .collect()
        };

        let value = sample.value();
        fired
            .into_iter()
            .map(|rule| {
                tracing::debug!(rule = %rule.id, source, "alert rule fired");
                self.raise(AlertDraft {
                    kind,
                    key: format!("rule:{}", rule.id),
                    severity: rule.severity,
                    message: format!("{} reported by {source}", rule.name),
                    title: rule.name,
                    source: source.to_owned(),
                    value,
                    rule_id: Some(rule.id),
                })
            })
            .collect()
    }

    /// Raises an alert, or bumps the unresolved alert with the same key.
    pub fn raise(&self, draft: AlertDraft) -> AlertId {
        let now = Instant::now();
        let wall = SystemTime::now();

        let event = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;

            let existing = state
                .alerts
                .iter()
                .position(|alert| alert.key == draft.key && !alert.is_resolved());

            match existing {
                Some(pos) => {
                    let alert = &mut state.alerts[pos];
                    alert.occurrences += 1;
                    alert.severity = alert.severity.max(draft.severity);
                    alert.message = draft.message;
                    alert.value = draft.value.or(alert.value);
                    alert.last_seen = wall;
                    alert.touched = now;
                    AlertEvent::Repeated(alert.clone())
                }
                None => {
                    state.next_id += 1;
                    let alert = Alert {
                        id: AlertId(state.next_id),
                        key: draft.key,
                        rule_id: draft.rule_id,
                        kind: draft.kind,
                        severity: draft.severity,
                        title: draft.title,
                        message: draft.message,
                        source: draft.source,
                        value: draft.value,
                        status: AlertStatus::Active,
                        occurrences: 1,
                        created_at: wall,
                        last_seen: wall,
                        touched: now,
                    };

                    while state.alerts.len() >= self.inner.config.max_alerts.max(1) {
                        let Some(dropped) = state.alerts.pop_front() else {
                            break;
                        };
                        if let Some(timer) = state.timers.remove(&dropped.id) {
                            timer.abort();
                        }
                    }

                    state.alerts.push_back(alert.clone());
                    self.schedule_resolve(state, alert.id);
                    AlertEvent::Raised(alert)
                }
            }
        };

        let alert = event.alert();
        let id = alert.id;
        if let AlertEvent::Raised(alert) = &event {
            match alert.severity {
                Severity::High | Severity::Critical => {
                    tracing::warn!(%id, severity = ?alert.severity, source = %alert.source, "{}", alert.title)
                }
                _ => tracing::info!(%id, severity = ?alert.severity, source = %alert.source, "{}", alert.title),
            }
            self.notify(alert);
        }

        let _ = self.inner.tx.send(event);
        id
    }

    fn schedule_resolve(&self, state: &mut AlertState, id: AlertId) {
        if !self.inner.config.auto_resolve {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let after = self.inner.config.auto_resolve_after;
        let timer = runtime.spawn(auto_resolve(weak, id, after));
        if let Some(previous) = state.timers.insert(id, timer) {
            previous.abort();
        }
    }

    /// Resolves `id` if it has been quiet for `after`, otherwise returns how
    /// much longer to wait.
    fn try_auto_resolve(&self, id: AlertId, after: Duration) -> Option<Duration> {
        let resolved = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;

            let Some(alert) = state.alerts.iter_mut().find(|alert| alert.id == id) else {
                state.timers.remove(&id);
                return None;
            };
            if alert.status != AlertStatus::Active {
                state.timers.remove(&id);
                return None;
            }

            let deadline = alert.touched + after;
            let now = Instant::now();
            if now < deadline {
                return Some(deadline - now);
            }

            alert.status = AlertStatus::Resolved;
            let resolved = alert.clone();
            state.timers.remove(&id);
            resolved
        };

        tracing::debug!(%id, "alert resolved automatically");
        let _ = self.inner.tx.send(AlertEvent::Resolved(resolved));
        None
    }

    fn notify(&self, alert: &Alert) {
        let config = &self.inner.config;
        if !config.notifications || alert.severity < config.notify_min_severity {
            return;
        }

        if self.permission() != NotificationPermission::Granted {
            return;
        }

        if let Err(err) = self.inner.notifier.notify(alert) {
            tracing::warn!("couldn't deliver notification for {}: {err}", alert.id);
        }
    }

    fn permission(&self) -> NotificationPermission {
        let mut permission = lock(&self.inner.permission);
        *permission.get_or_insert_with(|| {
            let granted = self.inner.notifier.request_permission();
            if granted != NotificationPermission::Granted {
                tracing::info!(permission = ?granted, "alert notifications are disabled");
            }
            granted
        })
    }

    /// Marks an active alert as seen. Acknowledged alerts never resolve on
    /// their own.
    pub fn acknowledge(&self, id: AlertId) -> bool {
        self.transition(id, AlertStatus::Acknowledged)
    }

    pub fn resolve(&self, id: AlertId) -> bool {
        self.transition(id, AlertStatus::Resolved)
    }

    fn transition(&self, id: AlertId, to: AlertStatus) -> bool {
        let alert = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;

            let Some(alert) = state.alerts.iter_mut().find(|alert| alert.id == id) else {
                return false;
            };
            let allowed = match to {
                AlertStatus::Acknowledged => alert.status == AlertStatus::Active,
                AlertStatus::Resolved => alert.status != AlertStatus::Resolved,
                AlertStatus::Active => false,
            };
            if !allowed {
                return false;
            }

            alert.status = to;
            let alert = alert.clone();
            if let Some(timer) = state.timers.remove(&id) {
                timer.abort();
            }
            alert
        };

        let event = match to {
            AlertStatus::Acknowledged => AlertEvent::Acknowledged(alert),
            _ => AlertEvent::Resolved(alert),
        };
        let _ = self.inner.tx.send(event);
        true
    }

    pub fn get(&self, id: AlertId) -> Option<Alert> {
        lock(&self.inner.state)
            .alerts
            .iter()
            .find(|alert| alert.id == id)
            .cloned()
    }

    /// Unresolved alerts, acknowledged ones included, oldest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        lock(&self.inner.state)
            .alerts
            .iter()
            .filter(|alert| !alert.is_resolved())
            .cloned()
            .collect()
    }

    /// Every retained alert, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        lock(&self.inner.state).alerts.iter().cloned().collect()
    }

    /// Adds a rule, replacing any rule with the same id.
    pub fn add_rule(&self, rule: AlertRule) {
        let mut state = lock(&self.inner.state);
        match state.rules.iter_mut().find(|stored| stored.id == rule.id) {
            Some(stored) => *stored = rule,
            None => state.rules.push(rule),
        }
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut state = lock(&self.inner.state);
        let before = state.rules.len();
        state.rules.retain(|rule| rule.id != id);
        state.rules.len() != before
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut state = lock(&self.inner.state);
        match state.rules.iter_mut().find(|rule| rule.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        lock(&self.inner.state).rules.clone()
    }

    /// Forgets every alert. Rules and their cooldowns are kept.
    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        state.alerts.clear();
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.inner.tx.subscribe()
    }
}

impl Default for AlertSystem {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

impl std::fmt::Debug for AlertSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("AlertSystem")
            .field("config", &self.inner.config)
            .field("rules", &state.rules.len())
            .field("alerts", &state.alerts.len())
            .finish()
    }
}

async fn auto_resolve(weak: Weak<AlertInner>, id: AlertId, after: Duration) {
    let mut wait = after;
    loop {
        tokio::time::sleep(wait).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match (AlertSystem { inner }).try_auto_resolve(id, after) {
            Some(remaining) => wait = remaining,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::monitor::Vital;

    fn quiet() -> AlertConfig {
        AlertConfig {
            default_rules: false,
            ..Default::default()
        }
    }

    fn cpu(usage: f64) -> MetricSample {
        MetricSample::Cpu(CpuUsageData {
            usage,
            probe_delay_ratio: 1.0,
            probe_time: Duration::ZERO,
            long_tasks: 0,
            long_task_time: Duration::ZERO,
            heavy_functions: 0,
            at: Instant::now(),
        })
    }

    fn draft(key: &str) -> AlertDraft {
        AlertDraft::new(MetricKind::Performance, key, key).source("test")
    }

    #[test]
    fn test_severity_ladder() {
        assert_eq!(derive_severity(95.0, 70.0, 90.0), Severity::Critical);
        assert_eq!(derive_severity(90.0, 70.0, 90.0), Severity::Critical);
        assert_eq!(derive_severity(75.0, 70.0, 90.0), Severity::High);
        assert_eq!(derive_severity(10.0, 70.0, 90.0), Severity::Medium);
        assert!(Severity::Critical > Severity::High && Severity::High > Severity::Medium);
    }

    #[test]
    fn test_conditions_are_typed() {
        let rule = AlertRule::cpu("cpu", "cpu", Severity::High, |cpu| cpu.usage > 50.0);
        assert_eq!(rule.kind(), MetricKind::Cpu);
        assert!(rule.condition().matches(&cpu(60.0)));
        assert!(!rule.condition().matches(&cpu(40.0)));

        let vital = MetricSample::Vitals(VitalReport::new(Vital::Lcp, 9000.0));
        assert!(!rule.condition().matches(&vital));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_skips_rule() {
        let alerts = AlertSystem::new(quiet());
        alerts.add_rule(
            AlertRule::cpu("hot", "Hot CPU", Severity::High, |cpu| cpu.usage > 80.0).cooldown(Duration::from_secs(30)),
        );

        let fired = alerts.check_rules(&cpu(90.0), "cpu-monitor");
        assert_eq!(fired.len(), 1);
        let id = fired[0];

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(alerts.check_rules(&cpu(99.0), "cpu-monitor").is_empty());
        assert_eq!(alerts.get(id).unwrap().occurrences, 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(alerts.check_rules(&cpu(99.0), "cpu-monitor"), vec![id]);

        let alert = alerts.get(id).unwrap();
        assert_eq!(alert.occurrences, 2);
        assert_eq!(alert.value, Some(99.0));
        assert_eq!(alert.rule_id.as_deref(), Some("hot"));
        assert_eq!(alerts.alerts().len(), 1);
    }

    #[test]
    fn test_only_enabled_rules_of_matching_kind_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let alerts = AlertSystem::new(quiet());
        alerts.add_rule(AlertRule::vitals("vitals", "vitals", Severity::Low, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }));
        alerts.add_rule(AlertRule::cpu("off", "off", Severity::Low, |_| true).disabled());

        assert!(alerts.check_rules(&cpu(100.0), "cpu-monitor").is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(alerts.set_rule_enabled("off", true));
        assert_eq!(alerts.check_rules(&cpu(100.0), "cpu-monitor").len(), 1);
        assert!(alerts.remove_rule("off"));
        assert!(!alerts.remove_rule("off"));
    }

    #[test]
    fn test_default_rules() {
        let alerts = AlertSystem::default();
        let ids: Vec<String> = alerts.rules().into_iter().map(|rule| rule.id).collect();
        assert!(ids.contains(&"cpu-high".to_owned()));
        assert!(ids.contains(&"memory-leak".to_owned()));

        let fired = alerts.check_rules(&cpu(97.0), "cpu-monitor");
        assert_eq!(fired.len(), 2);
        let severities: Vec<Severity> = fired.iter().map(|id| alerts.get(*id).unwrap().severity).collect();
        assert!(severities.contains(&Severity::Critical));
    }

    #[test]
    fn test_oldest_alerts_are_dropped() {
        let alerts = AlertSystem::new(AlertConfig {
            max_alerts: 3,
            ..quiet()
        });

        let ids: Vec<AlertId> = ["a", "b", "c", "d"].into_iter().map(|key| alerts.raise(draft(key))).collect();
        let kept: Vec<AlertId> = alerts.alerts().into_iter().map(|alert| alert.id).collect();
        assert_eq!(kept, ids[1..]);
        assert!(alerts.get(ids[0]).is_none());
    }

    #[test]
    fn test_resolved_alert_is_not_merged() {
        let alerts = AlertSystem::new(quiet());
        let first = alerts.raise(draft("a"));
        assert!(alerts.resolve(first));
        assert!(!alerts.resolve(first));

        let second = alerts.raise(draft("a"));
        assert_ne!(first, second);
        assert_eq!(alerts.active_alerts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_resolve_after_quiet_period() {
        let alerts = AlertSystem::new(AlertConfig {
            auto_resolve_after: Duration::from_secs(60),
            ..quiet()
        });
        let mut events = alerts.subscribe();

        let a = alerts.raise(draft("a"));
        let b = alerts.raise(draft("b"));
        assert!(alerts.acknowledge(b));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(alerts.raise(draft("a")), a);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(alerts.get(a).unwrap().status, AlertStatus::Active);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(alerts.get(a).unwrap().status, AlertStatus::Resolved);
        assert_eq!(alerts.get(b).unwrap().status, AlertStatus::Acknowledged);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                AlertEvent::Raised(_) => "raised",
                AlertEvent::Repeated(_) => "repeated",
                AlertEvent::Acknowledged(_) => "acknowledged",
                AlertEvent::Resolved(_) => "resolved",
            });
        }
        assert_eq!(kinds, ["raised", "raised", "acknowledged", "repeated", "resolved"]);
    }

    #[derive(Default)]
    struct Recording {
        granted: bool,
        fail: bool,
        requests: AtomicUsize,
        delivered: Mutex<Vec<String>>,
    }

    impl Notifier for Recording {
        fn request_permission(&self) -> NotificationPermission {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.granted {
                NotificationPermission::Granted
            } else {
                NotificationPermission::Denied
            }
        }

        fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("notification center is gone");
            }
            lock(&self.delivered).push(alert.key.clone());
            Ok(())
        }
    }

    fn notifying() -> AlertConfig {
        AlertConfig {
            notifications: true,
            ..quiet()
        }
    }

    #[test]
    fn test_notifications_respect_severity() {
        let notifier = Arc::new(Recording {
            granted: true,
            ..Default::default()
        });
        let alerts = AlertSystem::with_notifier(notifying(), notifier.clone());

        alerts.raise(draft("minor"));
        alerts.raise(draft("major").severity(Severity::Critical));
        alerts.raise(draft("major").severity(Severity::Critical));

        assert_eq!(*lock(&notifier.delivered), ["major"]);
        assert_eq!(notifier.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_denied_or_failing_notifications_are_harmless() {
        let denied = Arc::new(Recording::default());
        let alerts = AlertSystem::with_notifier(notifying(), denied.clone());
        alerts.raise(draft("a").severity(Severity::High));
        alerts.raise(draft("b").severity(Severity::High));
        assert!(lock(&denied.delivered).is_empty());
        assert_eq!(denied.requests.load(Ordering::SeqCst), 1);

        let failing = Arc::new(Recording {
            granted: true,
            fail: true,
            ..Default::default()
        });
        let alerts = AlertSystem::with_notifier(notifying(), failing);
        let id = alerts.raise(draft("c").severity(Severity::Critical));
        assert_eq!(alerts.get(id).unwrap().status, AlertStatus::Active);
    }
}
