//! Heuristic heap-leak detection over a window of readings.
//!
//! A leak is only reported when every one of these holds at once:
//!
//! 1. growth rate between the window endpoints is above a floor,
//! 2. and below a ceiling, which rules out one-off bulk allocations,
//! 3. absolute growth is above a byte floor,
//! 4. the window spans a minimum duration,
//! 5. growth is consistent: most steps grow, and enough of those grow by a
//!    significant amount,
//! 6. usage is already past a high-water mark.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::duration_ms;
use crate::monitor::probe::HeapStats;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakThresholds {
    /// Readings considered, newest last.
    pub window: usize,
    /// Bytes per second.
    pub min_growth_rate: f64,
    /// Bytes per second.
    pub max_growth_rate: f64,
    pub min_growth_bytes: u64,
    #[serde(with = "duration_ms")]
    pub min_span: Duration,
    /// Share of steps that must grow.
    pub min_positive_share: f64,
    /// Share of the growing steps that must grow by at least `significant_step`.
    pub min_significant_share: f64,
    pub significant_step: u64,
    pub high_water_percent: f64,
}

impl Default for LeakThresholds {
    fn default() -> Self {
        Self {
            window: 10,
            min_growth_rate: 50.0 * KIB,
            max_growth_rate: 10.0 * MIB,
            min_growth_bytes: 5 * 1024 * 1024,
            min_span: Duration::from_secs(30),
            min_positive_share: 0.7,
            min_significant_share: 0.5,
            significant_step: 100 * 1024,
            high_water_percent: 70.0,
        }
    }
}

/// One heap reading and when it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub at: Instant,
    pub heap: HeapStats,
}

/// The measured quantities and the verdict on every condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakAssessment {
    /// Bytes per second between the window endpoints.
    pub growth_rate: f64,
    pub growth_bytes: i64,
    #[serde(with = "duration_ms")]
    pub span: Duration,
    pub positive_share: f64,
    pub significant_share: f64,
    pub usage_percent: f64,

    pub rate_above_floor: bool,
    pub rate_below_ceiling: bool,
    pub growth_above_floor: bool,
    pub span_long_enough: bool,
    pub growth_consistent: bool,
    pub above_high_water: bool,
}

impl LeakAssessment {
    pub fn is_leak(&self) -> bool {
        self.rate_above_floor
            && self.rate_below_ceiling
            && self.growth_above_floor
            && self.span_long_enough
            && self.growth_consistent
            && self.above_high_water
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeakDetector {
    thresholds: LeakThresholds,
}

impl LeakDetector {
    pub fn new(thresholds: LeakThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &LeakThresholds {
        &self.thresholds
    }

    /// Evaluates the newest `window` readings. Needs at least two.
    pub fn assess(&self, readings: &[MemoryReading]) -> Option<LeakAssessment> {
        let t = &self.thresholds;
        let start = readings.len().saturating_sub(t.window.max(2));
        let window = &readings[start..];

        let (first, last) = match window {
            [first, .., last] => (first, last),
            _ => return None,
        };

        let span = last.at.saturating_duration_since(first.at);
        let growth_bytes = last.heap.used as i64 - first.heap.used as i64;
        let growth_rate = if span.is_zero() {
            0.0
        } else {
            growth_bytes as f64 / span.as_secs_f64()
        };

        let steps = window.len() - 1;
        let deltas = window
            .windows(2)
            .map(|pair| pair[1].heap.used as i64 - pair[0].heap.used as i64);
        let positive = deltas.clone().filter(|&d| d > 0).count();
        let significant = deltas
            .filter(|&d| d >= t.significant_step as i64)
            .count();

        let positive_share = positive as f64 / steps as f64;
        let significant_share = if positive == 0 {
            0.0
        } else {
            significant as f64 / positive as f64
        };
        let usage_percent = last.heap.usage_percent();

        Some(LeakAssessment {
            growth_rate,
            growth_bytes,
            span,
            positive_share,
            significant_share,
            usage_percent,
            rate_above_floor: growth_rate > t.min_growth_rate,
            rate_below_ceiling: growth_rate < t.max_growth_rate,
            growth_above_floor: growth_bytes >= t.min_growth_bytes as i64,
            span_long_enough: span >= t.min_span,
            growth_consistent: positive_share >= t.min_positive_share
                && significant_share >= t.min_significant_share,
            above_high_water: usage_percent > t.high_water_percent,
        })
    }
}
