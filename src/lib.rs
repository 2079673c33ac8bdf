#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
mod history;

pub mod alert;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod logger;
pub mod manager;
pub mod monitor;
pub mod persist;
pub mod pool;
pub mod profiler;

pub use crate::alert::{
    Alert, AlertConfig, AlertDraft, AlertEvent, AlertId, AlertRule, AlertStatus, AlertSystem, Condition, MetricKind,
    MetricSample, NotificationPermission, Notifier, Severity, derive_severity,
};
pub use crate::cache::{CacheConfig, CacheMetrics, ExecuteOptions, RequestCache, request_key};
pub use crate::concurrency::{
    BatchOptions, CancelResult, ConcurrencyConfig, ConcurrencyManager, ConcurrencyMetrics, TaskHandle, TaskId,
    TaskOptions, TaskStatus,
};
pub use crate::config::Config;
pub use crate::core::BoxFuture;
pub use crate::error::*;
pub use crate::history::RollingHistory;
pub use crate::logger::{LogEntry, LogLevel, Logger, LoggerConfig};
pub use crate::manager::{ManagerBuilder, ManagerConfig, ManagerStatus, PerformanceManager};
pub use crate::persist::{DurabilitySink, FileSink, MemorySink, NoopSink};
pub use crate::pool::{Lease, PoolConfig, PoolStats, ResourcePool};
pub use crate::profiler::{ComponentPerformanceData, ComponentProfiler, ProfilerConfig, ProfilerEvent, RenderPhase, RenderTimer};
