use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::alert::AlertConfig;
use crate::cache::CacheConfig;
use crate::concurrency::ConcurrencyConfig;
use crate::error::ConfigError;
use crate::logger::LoggerConfig;
use crate::manager::ManagerConfig;
use crate::monitor::{CpuConfig, MemoryConfig, PerformanceConfig, Threshold};
use crate::pool::PoolConfig;
use crate::profiler::ProfilerConfig;

/// Settings for every component, loadable from a single JSON document.
/// Missing sections and fields take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub logger: LoggerConfig,
    pub concurrency: ConcurrencyConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub cpu: CpuConfig,
    pub memory: MemoryConfig,
    pub performance: PerformanceConfig,
    pub alerts: AlertConfig,
    pub profiler: ProfilerConfig,
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let Config {
            manager,
            logger,
            concurrency,
            pool,
            cache,
            cpu,
            memory,
            performance,
            alerts,
            profiler,
        } = self;

        nonzero("manager.poll_interval", manager.poll_interval.is_zero())?;

        if !(0.0..=1.0).contains(&logger.sample_rate) {
            return Err(invalid("logger.sample_rate", format!("{} is outside 0..=1", logger.sample_rate)));
        }
        nonzero("logger.buffer_capacity", logger.buffer_capacity == 0)?;

        nonzero("concurrency.max_concurrent", concurrency.max_concurrent == 0)?;
        nonzero("concurrency.poll_interval", concurrency.poll_interval.is_zero())?;

        nonzero("pool.max_size", pool.max_size == 0)?;
        if pool.min_size > pool.max_size {
            return Err(invalid(
                "pool.min_size",
                format!("{} exceeds max_size {}", pool.min_size, pool.max_size),
            ));
        }

        nonzero("cache.max_entries", cache.max_entries == 0)?;
        nonzero("cache.max_memory_bytes", cache.max_memory_bytes == 0)?;

        nonzero("cpu.sample_interval", cpu.sample_interval.is_zero())?;
        nonzero("cpu.probe_iterations", cpu.probe_iterations == 0)?;

        nonzero("memory.sample_interval", memory.sample_interval.is_zero())?;
        ordered("memory", Threshold::new(memory.warning_percent, memory.critical_percent))?;
        for (field, share) in [
            ("memory.leak.min_positive_share", memory.leak.min_positive_share),
            ("memory.leak.min_significant_share", memory.leak.min_significant_share),
        ] {
            if !(0.0..=1.0).contains(&share) {
                return Err(invalid(field, format!("{share} is outside 0..=1")));
            }
        }
        if memory.leak.min_growth_rate >= memory.leak.max_growth_rate {
            return Err(invalid(
                "memory.leak.max_growth_rate",
                "must be above min_growth_rate".to_owned(),
            ));
        }

        nonzero("performance.collect_interval", performance.collect_interval.is_zero())?;
        let thresholds = &performance.thresholds;
        ordered("performance.thresholds.cpu_usage", thresholds.cpu_usage)?;
        ordered("performance.thresholds.memory_usage", thresholds.memory_usage)?;
        ordered("performance.thresholds.task_error_rate", thresholds.task_error_rate)?;
        ordered("performance.thresholds.lcp", thresholds.lcp)?;
        ordered("performance.thresholds.fcp", thresholds.fcp)?;
        ordered("performance.thresholds.cls", thresholds.cls)?;
        ordered("performance.thresholds.ttfb", thresholds.ttfb)?;

        nonzero("alerts.max_alerts", alerts.max_alerts == 0)?;

        if profiler.slow_render > profiler.very_slow_render {
            return Err(invalid(
                "profiler.slow_render",
                "must not exceed very_slow_render".to_owned(),
            ));
        }
        nonzero("profiler.storm_window", profiler.storm_window.is_zero())?;

        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

fn nonzero(field: &'static str, is_zero: bool) -> Result<(), ConfigError> {
    if is_zero {
        return Err(invalid(field, "must be greater than zero".to_owned()));
    }
    Ok(())
}

fn ordered(field: &'static str, threshold: Threshold) -> Result<(), ConfigError> {
    if threshold.warning > threshold.critical {
        return Err(invalid(
            field,
            format!("warning {} is above critical {}", threshold.warning, threshold.critical),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_document() {
        let config = Config::from_json_str(
            r#"{
                "concurrency": { "max_concurrent": 3, "default_timeout": 100 },
                "cache": { "default_ttl": 50 },
                "alerts": { "notify_min_severity": "critical" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.concurrency.max_concurrent, 3);
        assert_eq!(config.concurrency.default_timeout, Duration::from_millis(100));
        assert_eq!(config.concurrency.queue_limit, 100);
        assert_eq!(config.cache.default_ttl, Duration::from_millis(50));
        assert_eq!(config.alerts.notify_min_severity, crate::alert::Severity::Critical);
        assert_eq!(config.pool.max_size, 10);
    }

    #[test]
    fn test_rejects_nonsense() {
        let err = Config::from_json_str(r#"{ "concurrency": { "max_concurrent": 0 } }"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "concurrency.max_concurrent",
                ..
            }
        ));

        let err = Config::from_json_str(r#"{ "pool": { "min_size": 5, "max_size": 2 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "pool.min_size", .. }));

        let err = Config::from_json_str(r#"{ "logger": { "sample_rate": 1.5 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "logger.sample_rate", .. }));

        let err = Config::from_json_str(
            r#"{ "performance": { "thresholds": { "lcp": { "warning": 5000, "critical": 100 } } } }"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "performance.thresholds.lcp",
                ..
            }
        ));

        assert!(matches!(Config::from_json_str("{ nope"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("kansoku-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.join("config.json")).unwrap();
        fs::write(&path, r#"{ "manager": { "poll_interval": 250 } }"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.manager.poll_interval, Duration::from_millis(250));

        let missing = path.with_file_name("missing.json");
        assert!(matches!(Config::from_file(&missing), Err(ConfigError::Io(_))));
        fs::remove_dir_all(&dir).unwrap();
    }
}
