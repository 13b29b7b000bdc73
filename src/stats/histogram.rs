//! Chunk processing time histogram
//!
//! Wraps HdrHistogram to keep the distribution of per-chunk processing times
//! reported by workers, from 1 microsecond to 24 hours with 3 significant
//! digits.

use crate::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_MICROS: u64 = 86_400_000_000;

/// Distribution of chunk processing times
#[derive(Debug, Clone)]
pub struct ChunkTimings {
    histogram: Histogram<u64>,
}

/// Percentiles of [`ChunkTimings`], in microseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl ChunkTimings {
    pub fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, MAX_MICROS, 3)
            .map_err(|e| anyhow::anyhow!("Failed to create chunk time histogram: {:?}", e))?;
        Ok(Self { histogram })
    }

    /// Record one chunk time; out-of-range values are clamped
    pub fn record(&mut self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(MAX_MICROS);
        let _ = self.histogram.record(micros.clamp(1, MAX_MICROS));
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.histogram.is_empty() {
            return None;
        }
        Some(Duration::from_micros(self.histogram.value_at_percentile(percentile)))
    }

    pub fn summary(&self) -> TimingSummary {
        if self.histogram.is_empty() {
            return TimingSummary::default();
        }
        TimingSummary {
            count: self.histogram.len(),
            mean_us: self.histogram.mean(),
            p50_us: self.histogram.value_at_percentile(50.0),
            p90_us: self.histogram.value_at_percentile(90.0),
            p99_us: self.histogram.value_at_percentile(99.0),
            max_us: self.histogram.max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_timings() {
        let timings = ChunkTimings::new().unwrap();
        assert_eq!(timings.count(), 0);
        assert!(timings.percentile(50.0).is_none());
        assert_eq!(timings.summary(), TimingSummary::default());
    }

    #[test]
    fn test_percentiles() {
        let mut timings = ChunkTimings::new().unwrap();
        for ms in 1..=100 {
            timings.record(Duration::from_millis(ms));
        }
        let summary = timings.summary();
        assert_eq!(summary.count, 100);
        assert!((49_000..=51_000).contains(&summary.p50_us));
        assert!(summary.max_us >= 99_000);
    }

    #[test]
    fn test_zero_duration_is_clamped() {
        let mut timings = ChunkTimings::new().unwrap();
        timings.record(Duration::ZERO);
        assert_eq!(timings.count(), 1);
    }
}
