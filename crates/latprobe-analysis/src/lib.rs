//! Latency analysis: match sender and receiver records by frame timestamp,
//! count loss, and summarize the latency distribution.

use std::{collections::HashMap, fmt};

use latprobe_types::{
    config::{AnalysisConfig, LossMode, TrimPolicy},
    records::{FrameRecord, FrameTimestamp, ReceiverRecord, SenderRecord},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod stats;
pub mod verdict;

pub use stats::LatencySummary;
pub use verdict::{judge, Verdict};

/// Outcome of one analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyserResults {
    pub loss_mode: LossMode,
    pub count_total: u64,
    pub count_matched: u64,
    pub count_lost: u64,
    /// Sender frames lost before the first frame that made it through.
    pub count_initial_lost: u64,
    pub count_running_lost: u64,
    pub count_unmatched_received: u64,
    pub duplicate_sender_timestamps: u64,
    pub duplicate_receiver_timestamps: u64,
    pub latency_ignored_count: usize,
    pub latency: LatencySummary,
    /// Every matched latency in receive order, before trimming.
    #[serde(default, skip_serializing)]
    pub latencies: Vec<f64>,
}

impl AnalyserResults {
    pub fn loss_ratio(&self) -> f64 {
        if self.count_total == 0 {
            0.0
        } else {
            self.count_lost as f64 / self.count_total as f64
        }
    }
}

impl fmt::Display for AnalyserResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "testlatency: count_total={}, ", self.count_total)?;
        match self.loss_mode {
            LossMode::Aggregate => write!(f, "count_lost={}, ", self.count_lost)?,
            LossMode::Split => write!(
                f,
                "count_initial_lost={}, count_running_lost={}, ",
                self.count_initial_lost, self.count_running_lost
            )?,
        }
        write!(
            f,
            "latency_ignored_count={}, latency_min={:.3}, latency_max={:.3}, latency_avg={:.3}, latency_stddev={:.3}, latency_p50={:.3}, latency_p99={:.3}, latency_jitter={:.3}",
            self.latency_ignored_count,
            self.latency.min,
            self.latency.max,
            self.latency.avg,
            self.latency.stddev,
            self.latency.p50,
            self.latency.p99,
            self.latency.jitter
        )
    }
}

/// Joins the two record logs of a run.
pub struct Analyser<'a> {
    sender: &'a [SenderRecord],
    receiver: &'a [ReceiverRecord],
}

impl<'a> Analyser<'a> {
    pub fn new(sender: &'a [SenderRecord], receiver: &'a [ReceiverRecord]) -> Self {
        Self { sender, receiver }
    }

    pub fn analyse(&self, config: &AnalysisConfig) -> AnalyserResults {
        let (sender_index, duplicate_sender_timestamps) = index_by_timestamp(self.sender, "sender");
        let (receiver_index, duplicate_receiver_timestamps) =
            index_by_timestamp(self.receiver, "receiver");

        let mut count_matched = 0;
        let mut count_initial_lost = 0;
        let mut count_running_lost = 0;
        let mut seen_match = false;
        for record in self.sender {
            if receiver_index.contains_key(&record.timestamp) {
                count_matched += 1;
                seen_match = true;
            } else if seen_match {
                count_running_lost += 1;
            } else {
                count_initial_lost += 1;
            }
        }

        let mut latencies = Vec::new();
        let mut count_unmatched_received = 0;
        for (idx, received) in self.receiver.iter().enumerate() {
            // A duplicate timestamp only counts once: for the record that won the slot.
            if receiver_index.get(&received.timestamp) != Some(&idx) {
                continue;
            }
            match sender_index.get(&received.timestamp) {
                Some(&sent_idx) => {
                    let sent = &self.sender[sent_idx];
                    latencies.push(received.wallclock_ms() - sent.wallclock_ms());
                }
                None => {
                    warn!(
                        "received frame {} ({} points) not found in sender statistics",
                        received.timestamp,
                        received.point_count()
                    );
                    count_unmatched_received += 1;
                }
            }
        }

        let latency_ignored_count = ignored_leading(&latencies, config.trim);
        let latency =
            LatencySummary::from_samples(&latencies[latency_ignored_count..], config.stddev);
        debug!(
            matched = count_matched,
            samples = latencies.len(),
            ignored = latency_ignored_count,
            "latency analysis complete"
        );

        AnalyserResults {
            loss_mode: config.loss_mode,
            count_total: self.sender.len() as u64,
            count_matched,
            count_lost: count_initial_lost + count_running_lost,
            count_initial_lost,
            count_running_lost,
            count_unmatched_received,
            duplicate_sender_timestamps,
            duplicate_receiver_timestamps,
            latency_ignored_count,
            latency,
            latencies,
        }
    }
}

/// Map each timestamp to the position of its last record. Collisions are
/// logged and counted; the later record wins.
fn index_by_timestamp<R: FrameRecord>(
    records: &[R],
    side: &str,
) -> (HashMap<FrameTimestamp, usize>, u64) {
    let mut index = HashMap::with_capacity(records.len());
    let mut duplicates = 0;
    for (idx, record) in records.iter().enumerate() {
        if index.insert(record.timestamp(), idx).is_some() {
            warn!(
                "duplicate {side} timestamp {} at {side} num {}",
                record.timestamp(),
                record.sequence()
            );
            duplicates += 1;
        }
    }
    (index, duplicates)
}

/// Number of leading samples the trim policy discards.
pub fn ignored_leading(latencies: &[f64], policy: TrimPolicy) -> usize {
    match policy {
        TrimPolicy::None => 0,
        TrimPolicy::Leading { count } => count.min(latencies.len()),
        TrimPolicy::AboveMean => {
            let whole_run_mean = stats::mean(latencies);
            latencies
                .iter()
                .take_while(|latency| **latency > whole_run_mean)
                .count()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(ts: u64, wall: f64, num: u64) -> SenderRecord {
        SenderRecord {
            timestamp: ts,
            sender_wallclock_ms: wall,
            sender_num: num,
            sender_count: 1000,
        }
    }

    fn received(ts: u64, wall: f64, num: u64) -> ReceiverRecord {
        ReceiverRecord {
            timestamp: ts,
            receiver_wallclock_ms: wall,
            receiver_num: num,
            receiver_count: 1000,
        }
    }

    #[test]
    fn one_dropped_frame_out_of_four() {
        let sender: Vec<_> = (0..4).map(|t| sent(t, t as f64, t)).collect();
        let receiver: Vec<_> = [0u64, 1, 3]
            .iter()
            .enumerate()
            .map(|(num, &t)| received(t, t as f64 + 50.0, num as u64))
            .collect();

        let results = Analyser::new(&sender, &receiver).analyse(&AnalysisConfig::default());
        assert_eq!(results.count_total, 4);
        assert_eq!(results.count_lost, 1);
        assert_eq!(results.count_matched, 3);
        assert_eq!(results.latencies, vec![50.0, 50.0, 50.0]);
        assert_eq!(results.latency.min, 50.0);
        assert_eq!(results.latency.max, 50.0);
        assert_eq!(results.latency.avg, 50.0);
        assert_eq!(results.latency.stddev, 0.0);
        assert_eq!(results.count_initial_lost, 0);
        assert_eq!(results.count_running_lost, 1);
    }

    #[test]
    fn nothing_received_is_all_initial_loss() {
        let sender: Vec<_> = (0..5).map(|t| sent(t, 0.0, t)).collect();
        let config = AnalysisConfig {
            loss_mode: LossMode::Split,
            ..AnalysisConfig::default()
        };
        let results = Analyser::new(&sender, &[]).analyse(&config);
        assert_eq!(results.count_initial_lost, 5);
        assert_eq!(results.count_running_lost, 0);
        assert_eq!(results.count_lost + results.count_matched, results.count_total);
        assert_eq!(results.latency, LatencySummary::default());
        assert!(results.to_string().contains("count_initial_lost=5, count_running_lost=0"));
    }

    #[test]
    fn loss_split_around_first_match() {
        let sender: Vec<_> = (0..6).map(|t| sent(t, 0.0, t)).collect();
        let receiver = vec![received(2, 10.0, 0), received(3, 10.0, 1), received(5, 10.0, 2)];
        let results = Analyser::new(&sender, &receiver).analyse(&AnalysisConfig::default());
        assert_eq!(results.count_initial_lost, 2);
        assert_eq!(results.count_running_lost, 1);
        assert_eq!(results.count_lost, 3);
        assert_eq!(results.count_lost + results.count_matched, results.count_total);
        assert!(results.to_string().contains("count_lost=3,"));
    }

    #[test]
    fn duplicate_timestamps_keep_last_record() {
        let sender = vec![sent(1, 0.0, 0), sent(1, 10.0, 1), sent(2, 20.0, 2)];
        let receiver = vec![received(1, 100.0, 0), received(1, 115.0, 1), received(2, 40.0, 2)];
        let results = Analyser::new(&sender, &receiver).analyse(&AnalysisConfig::default());
        assert_eq!(results.duplicate_sender_timestamps, 1);
        assert_eq!(results.duplicate_receiver_timestamps, 1);
        assert_eq!(results.latencies, vec![105.0, 20.0]);
        assert!(results.latencies.len() <= sender.len().min(receiver.len()));
        assert_eq!(results.count_total, 3);
        assert_eq!(results.count_lost + results.count_matched, results.count_total);
    }

    #[test]
    fn unmatched_receiver_records_are_excluded() {
        let sender = vec![sent(1, 0.0, 0)];
        let receiver = vec![received(1, 30.0, 0), received(99, 5.0, 1)];
        let results = Analyser::new(&sender, &receiver).analyse(&AnalysisConfig::default());
        assert_eq!(results.count_unmatched_received, 1);
        assert_eq!(results.latencies, vec![30.0]);
        assert_eq!(results.latency.stddev, 0.0);
    }

    #[test]
    fn trim_policies() {
        let samples = [400.0, 300.0, 60.0, 50.0, 70.0, 500.0];
        assert_eq!(ignored_leading(&samples, TrimPolicy::None), 0);
        assert_eq!(ignored_leading(&samples, TrimPolicy::Leading { count: 2 }), 2);
        assert_eq!(ignored_leading(&samples, TrimPolicy::Leading { count: 99 }), 6);
        // whole-run mean is 230: the leading 400 and 300 go, the late 500 stays
        assert_eq!(ignored_leading(&samples, TrimPolicy::AboveMean), 2);
        assert_eq!(ignored_leading(&[], TrimPolicy::AboveMean), 0);
        assert_eq!(ignored_leading(&[5.0, 5.0], TrimPolicy::AboveMean), 0);
    }

    #[test]
    fn trimmed_samples_leave_the_summary() {
        let sender: Vec<_> = (0..4).map(|t| sent(t, 0.0, t)).collect();
        let receiver = vec![
            received(0, 900.0, 0),
            received(1, 40.0, 1),
            received(2, 50.0, 2),
            received(3, 60.0, 3),
        ];
        let config = AnalysisConfig {
            trim: TrimPolicy::AboveMean,
            ..AnalysisConfig::default()
        };
        let results = Analyser::new(&sender, &receiver).analyse(&config);
        assert_eq!(results.latency_ignored_count, 1);
        assert_eq!(results.latency.count, 3);
        assert_eq!(results.latency.max, 60.0);
        assert_eq!(results.latency.avg, 50.0);
        assert_eq!(results.latencies.len(), 4);
    }

    #[test]
    fn serialized_results_omit_raw_latencies() {
        let sender = vec![sent(1, 0.0, 0), sent(2, 10.0, 1)];
        let receiver = vec![received(1, 40.0, 0), received(2, 60.0, 1)];
        let results = Analyser::new(&sender, &receiver).analyse(&AnalysisConfig::default());
        let json = serde_json::to_value(&results).expect("serialize");
        assert!(json.get("latencies").is_none());
        assert_eq!(json["loss_mode"], "aggregate");
        assert_eq!(json["latency"]["avg"], 45.0);

        let back: AnalyserResults = serde_json::from_value(json).expect("deserialize");
        assert!(back.latencies.is_empty());
        assert_eq!(back.latency, results.latency);
    }
}
