use latprobe_types::config::Thresholds;
use serde::{Deserialize, Serialize};

use crate::AnalyserResults;

/// Pass/fail judgment of one run against caller-supplied thresholds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub violations: Vec<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            violations: vec![reason.into()],
        }
    }

    pub fn add_violation(&mut self, reason: impl Into<String>) {
        self.passed = false;
        self.violations.push(reason.into());
    }
}

pub fn judge(results: &AnalyserResults, thresholds: &Thresholds) -> Verdict {
    let mut verdict = Verdict::pass();

    let mut check_count = |name: &str, actual: u64, limit: Option<u64>| {
        if let Some(limit) = limit {
            if actual > limit {
                verdict.add_violation(format!("{name} {actual} exceeds limit {limit}"));
            }
        }
    };
    check_count("lost frames", results.count_lost, thresholds.max_lost);
    check_count(
        "initially lost frames",
        results.count_initial_lost,
        thresholds.max_initial_lost,
    );
    check_count(
        "running lost frames",
        results.count_running_lost,
        thresholds.max_running_lost,
    );

    if let Some(min) = thresholds.min_matched {
        if results.count_matched < min {
            verdict.add_violation(format!(
                "matched frames {} below minimum {min}",
                results.count_matched
            ));
        }
    }
    if let Some(max_ratio) = thresholds.max_loss_ratio {
        let ratio = results.loss_ratio();
        if ratio > max_ratio {
            verdict.add_violation(format!(
                "loss ratio {ratio:.3} exceeds limit {max_ratio:.3}"
            ));
        }
    }

    let latency = &results.latency;
    let mut check_ms = |name: &str, actual: f64, limit: Option<f64>| {
        if let Some(limit) = limit {
            if actual > limit {
                verdict.add_violation(format!("{name} {actual:.3}ms exceeds limit {limit:.3}ms"));
            }
        }
    };
    check_ms("average latency", latency.avg, thresholds.max_latency_avg_ms);
    check_ms("maximum latency", latency.max, thresholds.max_latency_max_ms);
    check_ms(
        "latency stddev",
        latency.stddev,
        thresholds.max_latency_stddev_ms,
    );
    check_ms("jitter", latency.jitter, thresholds.max_jitter_ms);

    verdict
}
