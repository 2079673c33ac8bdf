//! Host and page telemetry: CPU pressure, heap usage, Web Vitals, and the
//! snapshot aggregator sitting on top of them.

pub mod cpu;
pub mod leak;
pub mod memory;
pub mod performance;
pub mod probe;
pub mod vitals;

pub use cpu::{CpuConfig, CpuMonitor, CpuSignals, CpuUsageData, FunctionStats, LongTask, estimate_usage};
pub use leak::{LeakAssessment, LeakDetector, LeakThresholds, MemoryReading};
pub use memory::{MemoryConfig, MemoryMonitor, MemoryPressure, MemorySample, MemoryTrend};
pub use performance::{PerformanceConfig, PerformanceMonitor, PerformanceSnapshot, PerformanceThresholds, Threshold};
#[cfg(feature = "system")]
pub use probe::SystemHeapProbe;
pub use probe::{HeapProbe, HeapStats, ScriptedHeapProbe, StaticHeapProbe, UnsupportedProbe};
pub use vitals::{Rating, Vital, VitalReport, WebVitals};
