use async_trait::async_trait;
use latprobe_types::{events::Role, records::ReceiverRecord, Result};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    role_error,
    task::{RoleTask, TaskOutcome},
    transport::FrameSource,
    RecordSource, RoleRunner,
};

/// In-process receiver pulling decoded frames until the stream ends.
pub struct StreamReceiver<S> {
    source: Option<S>,
    task: RoleTask<ReceiverRecord>,
}

impl<S: FrameSource + 'static> StreamReceiver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            task: RoleTask::new(Role::Receiver),
        }
    }
}

#[async_trait]
impl<S: FrameSource + 'static> RoleRunner for StreamReceiver<S> {
    fn role(&self) -> Role {
        Role::Receiver
    }

    async fn start(&mut self) -> Result<()> {
        self.task.ensure_not_started()?;
        let mut source = self
            .source
            .take()
            .ok_or_else(|| role_error("receiver source already consumed"))?;

        self.task.spawn(move |mut shutdown| async move {
            let mut records = Vec::new();
            let mut exit_status = 0;
            let start = Instant::now();
            let mut num: u64 = 0;
            let mut uncompressed: u64 = 0;
            let mut max_transit_ms = 0.0_f64;

            loop {
                let next = tokio::select! {
                    next = source.next_frame() => next,
                    _ = shutdown.changed() => break,
                };
                match next {
                    Ok(Some(frame)) => {
                        let record = ReceiverRecord::now(num, frame.timestamp, frame.point_count);
                        let transit_ms = frame.transit_ms();
                        max_transit_ms = max_transit_ms.max(transit_ms);
                        if !frame.compressed {
                            uncompressed += 1;
                        }
                        debug!(transit_ms, compressed = frame.compressed, "{record}");
                        records.push(record);
                        num += 1;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("no point cloud received, aborting: {err}");
                        exit_status = 1;
                        break;
                    }
                }
            }
            info!(
                uncompressed,
                max_transit_ms,
                "received {num} point clouds in {:.3} seconds",
                start.elapsed().as_secs_f64()
            );
            debug!(statistics = ?source.statistics(), "receiver transport statistics");
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

impl<S: FrameSource + 'static> RecordSource<ReceiverRecord> for StreamReceiver<S> {
    fn take_records(&mut self) -> Vec<ReceiverRecord> {
        self.task.take_records()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use latprobe_types::records::Frame;

    use super::*;
    use crate::transport::{
        loopback, transport_error, FrameSink, LoopbackConfig, TransportStatistics,
    };

    #[tokio::test]
    async fn records_every_delivered_frame() {
        let (mut sink, source) = loopback(LoopbackConfig {
            delay: Duration::from_millis(5),
            drop_every: Some(2),
        });
        let mut receiver = StreamReceiver::new(source);
        receiver.start().await.expect("start receiver");
        for ts in [100, 200, 300, 400] {
            sink.feed(Frame::new(ts, 42, true)).await.expect("feed");
        }
        sink.close().await.expect("close");

        assert_eq!(receiver.join().await.expect("join"), 0);
        let records = receiver.take_records();
        let timestamps: Vec<_> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![100, 300]);
        assert_eq!(records[1].receiver_num, 1);
        assert_eq!(records[0].receiver_count, 42);
    }

    #[tokio::test]
    async fn stop_interrupts_an_idle_stream() {
        let (_sink, source) = loopback(LoopbackConfig::default());
        let mut receiver = StreamReceiver::new(source);
        receiver.start().await.expect("start receiver");
        receiver.stop().await.expect("stop");
        let status = tokio::time::timeout(Duration::from_secs(5), receiver.join())
            .await
            .expect("receiver stopped in time")
            .expect("join");
        assert_eq!(status, 0);
        assert!(receiver.is_finished());
    }

    struct FailingSource;

    #[async_trait]
    impl FrameSource for FailingSource {
        async fn next_frame(&mut self) -> Result<Option<Frame>> {
            Err(transport_error("decoder lost sync"))
        }

        fn statistics(&self) -> TransportStatistics {
            TransportStatistics::default()
        }
    }

    #[tokio::test]
    async fn source_error_sets_exit_status() {
        let mut receiver = StreamReceiver::new(FailingSource);
        receiver.start().await.expect("start receiver");
        assert_eq!(receiver.join().await.expect("join"), 1);
        assert!(receiver.take_records().is_empty());
    }
}
