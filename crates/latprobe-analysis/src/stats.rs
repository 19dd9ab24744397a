//! Descriptive statistics over latency samples, in milliseconds.

use latprobe_types::config::StdDevKind;
use serde::{Deserialize, Serialize};

/// Aggregates over the latency samples kept after trimming. Every field is
/// zero when there are no samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    /// Mean absolute difference between consecutive samples.
    pub jitter: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[f64], kind: StdDevKind) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self {
            count: samples.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            avg: mean(samples),
            stddev: stddev(samples, kind),
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p99: percentile(&sorted, 99.0),
            jitter: jitter(samples),
        }
    }
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Standard deviation; zero for fewer than two samples, where the sample
/// estimator is undefined.
pub fn stddev(samples: &[f64], kind: StdDevKind) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let avg = mean(samples);
    let squares: f64 = samples.iter().map(|x| (x - avg).powi(2)).sum();
    let divisor = match kind {
        StdDevKind::Population => samples.len(),
        StdDevKind::Sample => samples.len() - 1,
    };
    (squares / divisor as f64).sqrt()
}

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub fn jitter(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let total: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (samples.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn empty_samples_summarize_to_zero() {
        let summary = LatencySummary::from_samples(&[], StdDevKind::Sample);
        assert_eq!(summary, LatencySummary::default());
        assert_eq!(stddev(&[], StdDevKind::Population), 0.0);
        assert_eq!(percentile(&[], 99.0), 0.0);
    }

    #[test]
    fn single_sample_has_no_spread() {
        let summary = LatencySummary::from_samples(&[42.0], StdDevKind::Sample);
        assert_eq!(summary.count, 1);
        assert_eq!(summary.min, 42.0);
        assert_eq!(summary.max, 42.0);
        assert_eq!(summary.avg, 42.0);
        assert_eq!(summary.stddev, 0.0);
        assert_eq!(summary.jitter, 0.0);
        assert_eq!(summary.p99, 42.0);
    }

    #[test]
    fn sample_and_population_stddev_differ() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!(close(stddev(&samples, StdDevKind::Population), 2.0));
        assert!(close(
            stddev(&samples, StdDevKind::Sample),
            (32.0f64 / 7.0).sqrt()
        ));
    }

    #[test]
    fn nearest_rank_percentiles() {
        let sorted: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 50.0), 5.0);
        assert_eq!(percentile(&sorted, 90.0), 9.0);
        assert_eq!(percentile(&sorted, 99.0), 10.0);
        assert_eq!(percentile(&sorted, 0.0), 1.0);
    }

    #[test]
    fn jitter_tracks_consecutive_changes() {
        assert!(close(jitter(&[10.0, 20.0, 10.0, 10.0]), 20.0 / 3.0));
        let summary = LatencySummary::from_samples(&[30.0, 10.0, 20.0], StdDevKind::Sample);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 30.0);
        assert!(close(summary.avg, 20.0));
        assert!(close(summary.jitter, 15.0));
    }
}
