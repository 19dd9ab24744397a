use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use latprobe_types::{
    config::SenderConfig,
    events::Role,
    records::{Frame, FrameTimestamp, SenderRecord},
    Result,
};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    role_error,
    task::{RoleTask, TaskOutcome},
    transport::FrameSink,
    RecordSource, RoleRunner,
};

#[derive(Debug, Clone)]
pub struct SyntheticSettings {
    pub duration: Duration,
    pub fps: u32,
    pub npoints: u32,
    pub compressed: bool,
}

impl From<&SenderConfig> for SyntheticSettings {
    fn from(config: &SenderConfig) -> Self {
        Self {
            duration: Duration::from_secs(config.duration_secs),
            fps: config.fps,
            npoints: config.npoints,
            compressed: !config.uncompressed,
        }
    }
}

/// In-process sender generating synthetic point clouds at a fixed rate and
/// feeding them to a [`FrameSink`].
pub struct SyntheticSender<K> {
    settings: SyntheticSettings,
    sink: Option<K>,
    task: RoleTask<SenderRecord>,
}

impl<K: FrameSink + 'static> SyntheticSender<K> {
    pub fn new(settings: SyntheticSettings, sink: K) -> Self {
        Self {
            settings,
            sink: Some(sink),
            task: RoleTask::new(Role::Sender),
        }
    }
}

/// Wall-clock frame timestamp, bumped past `last` so consecutive frames of
/// this sender never share a key.
fn next_timestamp(last: Option<FrameTimestamp>) -> FrameTimestamp {
    let now = Utc::now().timestamp_millis().max(0) as FrameTimestamp;
    match last {
        Some(last) if now <= last => last + 1,
        _ => now,
    }
}

#[async_trait]
impl<K: FrameSink + 'static> RoleRunner for SyntheticSender<K> {
    fn role(&self) -> Role {
        Role::Sender
    }

    async fn start(&mut self) -> Result<()> {
        self.task.ensure_not_started()?;
        if self.settings.fps == 0 {
            return Err(role_error("synthetic sender needs fps > 0"));
        }
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| role_error("sender sink already consumed"))?;
        let settings = self.settings.clone();

        self.task.spawn(move |mut shutdown| async move {
            let mut records = Vec::new();
            let mut exit_status = 0;
            let mut last_timestamp = None;
            let mut ticker = interval(Duration::from_secs_f64(1.0 / f64::from(settings.fps)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let start = Instant::now();
            let mut num: u64 = 0;

            while start.elapsed() < settings.duration && !*shutdown.borrow() {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let timestamp = next_timestamp(last_timestamp);
                last_timestamp = Some(timestamp);
                let record = SenderRecord::now(num, timestamp, settings.npoints);
                debug!("{record}");
                records.push(record);
                let frame = Frame::new(timestamp, settings.npoints, settings.compressed);
                if let Err(err) = sink.feed(frame).await {
                    warn!("sender sink rejected frame {num}, exiting: {err}");
                    exit_status = 1;
                    break;
                }
                num += 1;
            }
            info!(
                "sent {num} point clouds in {:.3} seconds",
                start.elapsed().as_secs_f64()
            );

            if let Err(err) = sink.close().await {
                warn!("closing sender sink failed: {err}");
                exit_status = 1;
            }
            debug!(statistics = ?sink.statistics(), "sender transport statistics");
            TaskOutcome::new(exit_status, records)
        })
    }

    async fn stop(&mut self) -> Result<()> {
        self.task.request_stop();
        Ok(())
    }

    async fn join(&mut self) -> Result<i32> {
        self.task.join().await
    }

    fn exit_status(&self) -> Option<i32> {
        self.task.exit_status()
    }

    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<K: FrameSink + 'static> RecordSource<SenderRecord> for SyntheticSender<K> {
    fn take_records(&mut self) -> Vec<SenderRecord> {
        self.task.take_records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{loopback, transport_error, FrameSource, LoopbackConfig, TransportStatistics};

    fn settings(duration_ms: u64, fps: u32) -> SyntheticSettings {
        SyntheticSettings {
            duration: Duration::from_millis(duration_ms),
            fps,
            npoints: 500,
            compressed: true,
        }
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let first = next_timestamp(None);
        let second = next_timestamp(Some(first + 10));
        assert_eq!(second, first + 11);
    }

    #[tokio::test]
    async fn emits_records_in_sequence_and_closes_stream() {
        let (sink, mut source) = loopback(LoopbackConfig::default());
        let mut sender = SyntheticSender::new(settings(200, 50), sink);
        sender.start().await.expect("start sender");
        assert_eq!(sender.join().await.expect("join"), 0);

        let records = sender.take_records();
        assert!(!records.is_empty());
        assert!(records.windows(2).all(|w| w[0].sender_num + 1 == w[1].sender_num));
        assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(records.iter().all(|r| r.sender_count == 500));

        let mut delivered = 0;
        while source.next_frame().await.expect("next").is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, records.len());
    }

    #[tokio::test]
    async fn stop_ends_the_loop_early() {
        let (sink, _source) = loopback(LoopbackConfig::default());
        let mut sender = SyntheticSender::new(settings(60_000, 20), sink);
        sender.start().await.expect("start sender");
        tokio::time::sleep(Duration::from_millis(100)).await;
        sender.stop().await.expect("stop");
        let status = tokio::time::timeout(Duration::from_secs(5), sender.join())
            .await
            .expect("sender stopped in time")
            .expect("join");
        assert_eq!(status, 0);
    }

    struct BrokenSink;

    #[async_trait]
    impl FrameSink for BrokenSink {
        async fn feed(&mut self, _frame: Frame) -> Result<()> {
            Err(transport_error("encoder unavailable"))
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn statistics(&self) -> TransportStatistics {
            TransportStatistics::default()
        }
    }

    #[tokio::test]
    async fn sink_failure_sets_exit_status() {
        let mut sender = SyntheticSender::new(settings(1_000, 10), BrokenSink);
        sender.start().await.expect("start sender");
        assert_eq!(sender.join().await.expect("join"), 1);
        assert_eq!(sender.take_records().len(), 1);
    }
}
