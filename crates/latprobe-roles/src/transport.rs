//! In-process transport seam between the synthetic sender and the stream
//! receiver, plus a loopback implementation.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use latprobe_types::{config::TransportConfig, records::Frame, LatprobeError, Result};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tracing::debug;

/// Diagnostic counters a transport endpoint exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStatistics {
    pub frames_fed: u64,
    pub frames_dropped: u64,
    pub frames_delivered: u64,
    pub points_delivered: u64,
}

/// Encoder/packager side of the pipeline.
#[async_trait]
pub trait FrameSink: Send {
    async fn feed(&mut self, frame: Frame) -> Result<()>;
    /// Flush and signal end of stream to the other side.
    async fn close(&mut self) -> Result<()>;
    fn statistics(&self) -> TransportStatistics;
}

/// Subscriber/decoder side of the pipeline.
#[async_trait]
pub trait FrameSource: Send {
    /// Next decoded frame, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> Result<Option<Frame>>;
    fn statistics(&self) -> TransportStatistics;
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackConfig {
    pub delay: Duration,
    pub drop_every: Option<u64>,
}

impl From<&TransportConfig> for LoopbackConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.delay_ms),
            drop_every: config.drop_every,
        }
    }
}

/// Create a connected sink/source pair. Frames arrive in order after a fixed
/// delay; with `drop_every = n` every nth fed frame is discarded.
pub fn loopback(config: LoopbackConfig) -> (LoopbackSink, LoopbackSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(Mutex::new(TransportStatistics::default()));
    (
        LoopbackSink {
            tx: Some(tx),
            config,
            stats: stats.clone(),
        },
        LoopbackSource { rx, stats },
    )
}

pub struct LoopbackSink {
    tx: Option<mpsc::UnboundedSender<(Frame, Instant)>>,
    config: LoopbackConfig,
    stats: Arc<Mutex<TransportStatistics>>,
}

pub struct LoopbackSource {
    rx: mpsc::UnboundedReceiver<(Frame, Instant)>,
    stats: Arc<Mutex<TransportStatistics>>,
}

impl LoopbackSink {
    fn record<F: FnOnce(&mut TransportStatistics)>(&self, update: F) -> Result<()> {
        let mut stats = self
            .stats
            .lock()
            .map_err(|_| transport_error("failed to lock transport statistics"))?;
        update(&mut stats);
        Ok(())
    }
}

#[async_trait]
impl FrameSink for LoopbackSink {
    async fn feed(&mut self, frame: Frame) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| transport_error("feed after close"))?;
        let mut fed = 0;
        self.record(|stats| {
            stats.frames_fed += 1;
            fed = stats.frames_fed;
        })?;
        if matches!(self.config.drop_every, Some(n) if n > 0 && fed % n == 0) {
            debug!(timestamp = frame.timestamp, "loopback dropping frame");
            return self.record(|stats| stats.frames_dropped += 1);
        }
        let deliver_at = Instant::now() + self.config.delay;
        tx.send((frame, deliver_at))
            .map_err(|_| transport_error("loopback receiver has gone away"))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }

    fn statistics(&self) -> TransportStatistics {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FrameSource for LoopbackSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some((frame, deliver_at)) = self.rx.recv().await else {
            return Ok(None);
        };
        sleep_until(deliver_at).await;
        let mut stats = self
            .stats
            .lock()
            .map_err(|_| transport_error("failed to lock transport statistics"))?;
        stats.frames_delivered += 1;
        stats.points_delivered += u64::from(frame.point_count);
        Ok(Some(frame))
    }

    fn statistics(&self) -> TransportStatistics {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub fn transport_error(message: impl Into<String>) -> LatprobeError {
    LatprobeError::Transport(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_order_and_stream_ends_on_close() {
        let (mut sink, mut source) = loopback(LoopbackConfig::default());
        for ts in [10, 20, 30] {
            sink.feed(Frame::new(ts, 100, true)).await.expect("feed");
        }
        sink.close().await.expect("close");
        assert!(sink.feed(Frame::new(40, 100, true)).await.is_err());

        let mut seen = Vec::new();
        while let Some(frame) = source.next_frame().await.expect("next") {
            seen.push(frame.timestamp);
        }
        assert_eq!(seen, vec![10, 20, 30]);
        let stats = source.statistics();
        assert_eq!(stats.frames_fed, 3);
        assert_eq!(stats.frames_delivered, 3);
        assert_eq!(stats.points_delivered, 300);
    }

    #[tokio::test]
    async fn every_nth_frame_is_dropped() {
        let (mut sink, mut source) = loopback(LoopbackConfig {
            delay: Duration::ZERO,
            drop_every: Some(3),
        });
        for ts in 1..=6 {
            sink.feed(Frame::new(ts, 1, false)).await.expect("feed");
        }
        sink.close().await.expect("close");

        let mut seen = Vec::new();
        while let Some(frame) = source.next_frame().await.expect("next") {
            seen.push(frame.timestamp);
        }
        assert_eq!(seen, vec![1, 2, 4, 5]);
        assert_eq!(sink.statistics().frames_dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_waits_for_configured_delay() {
        let (mut sink, mut source) = loopback(LoopbackConfig {
            delay: Duration::from_millis(50),
            drop_every: None,
        });
        let start = Instant::now();
        sink.feed(Frame::new(1, 1, false)).await.expect("feed");
        source.next_frame().await.expect("next").expect("frame");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
