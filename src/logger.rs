//! Buffered, sampled and leveled log sink.
//!
//! The [`Logger`] collects structured entries in memory and periodically
//! appends them to a [`DurabilitySink`] under [`LOGS_KEY`]. Kept entries are
//! also emitted through `tracing`, so a host that installed a subscriber sees
//! them alongside the rest of its diagnostics.

#[cfg(feature = "logging")]
mod layer;

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use console::style;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::core::{duration_ms, lock};
use crate::persist::{DurabilitySink, LOGS_KEY, load_json, mirror_json};

#[cfg(feature = "logging")]
pub use layer::{BufferLayer, init_tracing};

/// Target used for events re-emitted by the logger, so the tracing bridge can
/// recognise and skip them.
pub(crate) const LOGGER_TARGET: &str = "kansoku::logger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
    pub target: String,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Entries below this level are dropped outright.
    pub min_level: LogLevel,
    /// Fraction of `debug`/`info` entries kept. Warnings and errors are
    /// always kept.
    pub sample_rate: f64,
    /// Number of buffered entries that triggers an immediate flush.
    pub buffer_capacity: usize,
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
    /// Newest entries retained in the durability sink.
    pub max_persisted: usize,
    /// Print kept entries to stderr.
    pub console: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            sample_rate: 1.0,
            buffer_capacity: 100,
            flush_interval: Duration::from_secs(30),
            max_persisted: 500,
            console: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoggerStats {
    pub kept: u64,
    pub filtered: u64,
    pub sampled_out: u64,
    pub flushed: u64,
    pub persist_failures: u64,
}

#[derive(Default)]
struct LoggerState {
    buffer: Vec<LogEntry>,
    sampler: f64,
    stats: LoggerStats,
}

pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn DurabilitySink>,
    state: Mutex<LoggerState>,
    /// Serializes the load-extend-store cycle on the sink.
    persist: Mutex<()>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Logger {
    pub fn new(config: LoggerConfig, sink: Arc<dyn DurabilitySink>) -> Self {
        Self {
            config,
            sink,
            state: Mutex::default(),
            persist: Mutex::new(()),
            flusher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    pub fn debug(&self, message: impl Into<String>, context: serde_json::Value) -> bool {
        self.log(LogLevel::Debug, message, context)
    }

    pub fn info(&self, message: impl Into<String>, context: serde_json::Value) -> bool {
        self.log(LogLevel::Info, message, context)
    }

    pub fn warn(&self, message: impl Into<String>, context: serde_json::Value) -> bool {
        self.log(LogLevel::Warn, message, context)
    }

    pub fn error(&self, message: impl Into<String>, context: serde_json::Value) -> bool {
        self.log(LogLevel::Error, message, context)
    }

    /// Records an entry. Returns whether it was kept.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, context: serde_json::Value) -> bool {
        self.record(level, message.into(), context, LOGGER_TARGET, true)
    }

    pub(crate) fn record(
        &self,
        level: LogLevel,
        message: String,
        context: serde_json::Value,
        target: &str,
        emit: bool,
    ) -> bool {
        let entry = LogEntry {
            level,
            message,
            context,
            target: target.to_string(),
            timestamp: SystemTime::now(),
        };

        let full = {
            let mut state = lock(&self.state);

            if level < self.config.min_level {
                state.stats.filtered += 1;
                return false;
            }

            if level < LogLevel::Warn && !sample(&mut state.sampler, self.config.sample_rate) {
                state.stats.sampled_out += 1;
                return false;
            }

            state.stats.kept += 1;
            state.buffer.push(entry.clone());
            state.buffer.len() >= self.config.buffer_capacity
        };

        if emit {
            emit_tracing(&entry);
        }
        if self.config.console {
            print_console(&entry);
        }

        if full {
            self.flush();
        }

        true
    }

    /// Moves the buffered entries into the durability sink. Returns the
    /// number of entries drained from the buffer.
    pub fn flush(&self) -> usize {
        let _persist = lock(&self.persist);
        let drained = std::mem::take(&mut lock(&self.state).buffer);
        if drained.is_empty() {
            return 0;
        }

        let count = drained.len();
        let mut persisted: Vec<LogEntry> = load_json(&*self.sink, LOGS_KEY).unwrap_or_default();
        persisted.extend(drained);

        let excess = persisted.len().saturating_sub(self.config.max_persisted);
        persisted.drain(..excess);

        let stored = mirror_json(&*self.sink, LOGS_KEY, &persisted);

        let mut state = lock(&self.state);
        state.stats.flushed += count as u64;
        if !stored {
            state.stats.persist_failures += 1;
        }

        count
    }

    /// Starts the periodic flush. Returns `false` when no tokio runtime is
    /// available or the flusher is already running.
    pub fn start_auto_flush(self: &Arc<Self>) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime, periodic log flushing disabled");
            return false;
        };

        let mut flusher = lock(&self.flusher);
        if flusher.is_some() {
            return false;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.flush_interval;
        *flusher = Some(handle.spawn(flush_loop(weak, period)));
        true
    }

    pub fn stop_auto_flush(&self) {
        if let Some(task) = lock(&self.flusher).take() {
            task.abort();
        }
        self.flush();
    }

    /// The newest `n` buffered (not yet flushed) entries.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let state = lock(&self.state);
        let skip = state.buffer.len().saturating_sub(n);
        state.buffer[skip..].to_vec()
    }

    /// Entries already written to the durability sink.
    pub fn persisted(&self) -> Vec<LogEntry> {
        load_json(&*self.sink, LOGS_KEY).unwrap_or_default()
    }

    pub fn stats(&self) -> LoggerStats {
        lock(&self.state).stats
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.flusher).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn flush_loop(logger: Weak<Logger>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match logger.upgrade() {
            Some(logger) => {
                logger.flush();
            }
            None => break,
        }
    }
}

/// Deterministic fractional sampler: with a rate of 0.25 exactly every fourth
/// call returns `true`.
fn sample(acc: &mut f64, rate: f64) -> bool {
    let rate = rate.clamp(0.0, 1.0);
    if rate >= 1.0 {
        return true;
    }

    *acc += rate;
    if *acc >= 1.0 - f64::EPSILON {
        *acc -= 1.0;
        true
    } else {
        false
    }
}

fn emit_tracing(entry: &LogEntry) {
    let message = &entry.message;
    let context = &entry.context;
    match entry.level {
        LogLevel::Debug => tracing::debug!(target: "kansoku::logger", %context, "{message}"),
        LogLevel::Info => tracing::info!(target: "kansoku::logger", %context, "{message}"),
        LogLevel::Warn => tracing::warn!(target: "kansoku::logger", %context, "{message}"),
        LogLevel::Error => tracing::error!(target: "kansoku::logger", %context, "{message}"),
    }
}

fn print_console(entry: &LogEntry) {
    let tag = format!("[{}]", entry.level.as_str().to_uppercase());
    let tag = match entry.level {
        LogLevel::Debug => style(tag).dim(),
        LogLevel::Info => style(tag).blue(),
        LogLevel::Warn => style(tag).yellow(),
        LogLevel::Error => style(tag).red().bold(),
    };

    if entry.context.is_null() {
        eprintln!("{tag} {}", entry.message);
    } else {
        eprintln!("{tag} {} {}", entry.message, style(&entry.context).dim());
    }
}
