use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LatprobeError, Result};

/// Logical capture time of a frame, in milliseconds.
pub type FrameTimestamp = u64;

const LINE_PREFIX: &str = "testlatency: ";
const SENDER_TAG: &str = "testlatency: sender: ";
const RECEIVER_TAG: &str = "testlatency: receiver: ";

/// Wall-clock values below this are seconds since the epoch, not milliseconds.
const SECONDS_SCALE_LIMIT: f64 = 1e11;

/// Current wall-clock time as fractional milliseconds since the Unix epoch.
pub fn wallclock_ms() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1000.0
}

/// Unit of data moved across the in-process transport seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp: FrameTimestamp,
    pub point_count: u32,
    pub compressed: bool,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(timestamp: FrameTimestamp, point_count: u32, compressed: bool) -> Self {
        Self {
            timestamp,
            point_count,
            compressed,
            captured_at: Utc::now(),
        }
    }

    /// Milliseconds since the frame was captured.
    pub fn transit_ms(&self) -> f64 {
        let elapsed = Utc::now() - self.captured_at;
        elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0
    }
}

/// Common view over sender and receiver records used by the analyser and
/// by the output scanners of external roles.
pub trait FrameRecord: Clone + Send + Sync + 'static {
    fn timestamp(&self) -> FrameTimestamp;
    fn wallclock_ms(&self) -> f64;
    fn sequence(&self) -> u64;
    fn point_count(&self) -> u32;

    /// Recover a record from one line of role output. Lines that are not
    /// records of this kind yield `Ok(None)`.
    fn from_line(line: &str) -> Result<Option<Self>>;
}

/// One frame handed to the transport by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderRecord {
    pub timestamp: FrameTimestamp,
    pub sender_wallclock_ms: f64,
    pub sender_num: u64,
    pub sender_count: u32,
}

/// One frame delivered to the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverRecord {
    pub timestamp: FrameTimestamp,
    pub receiver_wallclock_ms: f64,
    pub receiver_num: u64,
    pub receiver_count: u32,
}

impl SenderRecord {
    pub fn now(num: u64, timestamp: FrameTimestamp, count: u32) -> Self {
        Self {
            timestamp,
            sender_wallclock_ms: wallclock_ms(),
            sender_num: num,
            sender_count: count,
        }
    }
}

impl ReceiverRecord {
    pub fn now(num: u64, timestamp: FrameTimestamp, count: u32) -> Self {
        Self {
            timestamp,
            receiver_wallclock_ms: wallclock_ms(),
            receiver_num: num,
            receiver_count: count,
        }
    }

    /// Latency relative to the frame's own timestamp, meaningful when the
    /// sender stamps frames with its wall clock.
    pub fn apparent_latency_ms(&self) -> f64 {
        self.receiver_wallclock_ms - self.timestamp as f64
    }
}

impl fmt::Display for SenderRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SENDER_TAG}now={:.3}, timestamp={}, sender_num={}, sender_pointcount={}",
            self.sender_wallclock_ms, self.timestamp, self.sender_num, self.sender_count
        )
    }
}

impl fmt::Display for ReceiverRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{RECEIVER_TAG}now={:.3}, num={}, timestamp={}, latency={:.3}, pointcount={}",
            self.receiver_wallclock_ms,
            self.receiver_num,
            self.timestamp,
            self.apparent_latency_ms(),
            self.receiver_count
        )
    }
}

impl FrameRecord for SenderRecord {
    fn timestamp(&self) -> FrameTimestamp {
        self.timestamp
    }

    fn wallclock_ms(&self) -> f64 {
        self.sender_wallclock_ms
    }

    fn sequence(&self) -> u64 {
        self.sender_num
    }

    fn point_count(&self) -> u32 {
        self.sender_count
    }

    fn from_line(line: &str) -> Result<Option<Self>> {
        let Some(fields) = tagged_fields(line, SENDER_TAG) else {
            return Ok(None);
        };
        Ok(Some(Self {
            timestamp: parse_timestamp(&fields, line)?,
            sender_wallclock_ms: parse_wallclock(&fields, line)?,
            sender_num: parse_field(&fields, "sender_num", line)?,
            sender_count: parse_field(&fields, "sender_pointcount", line)?,
        }))
    }
}

impl FrameRecord for ReceiverRecord {
    fn timestamp(&self) -> FrameTimestamp {
        self.timestamp
    }

    fn wallclock_ms(&self) -> f64 {
        self.receiver_wallclock_ms
    }

    fn sequence(&self) -> u64 {
        self.receiver_num
    }

    fn point_count(&self) -> u32 {
        self.receiver_count
    }

    fn from_line(line: &str) -> Result<Option<Self>> {
        let Some(fields) = tagged_fields(line, RECEIVER_TAG) else {
            return Ok(None);
        };
        Ok(Some(Self {
            timestamp: parse_timestamp(&fields, line)?,
            receiver_wallclock_ms: parse_wallclock(&fields, line)?,
            receiver_num: parse_field(&fields, "num", line)?,
            receiver_count: parse_field(&fields, "pointcount", line)?,
        }))
    }
}

/// Either kind of record, as found in a mixed log.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordLine {
    Sender(SenderRecord),
    Receiver(ReceiverRecord),
}

/// Classify one output line. Returns `Ok(None)` for lines that carry no record.
pub fn parse_line(line: &str) -> Result<Option<RecordLine>> {
    if !line.contains(LINE_PREFIX) {
        return Ok(None);
    }
    if let Some(record) = SenderRecord::from_line(line)? {
        return Ok(Some(RecordLine::Sender(record)));
    }
    Ok(ReceiverRecord::from_line(line)?.map(RecordLine::Receiver))
}

fn tagged_fields<'a>(line: &'a str, tag: &str) -> Option<HashMap<&'a str, &'a str>> {
    let start = line.find(tag)? + tag.len();
    let fields = line[start..]
        .trim()
        .split(',')
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect();
    Some(fields)
}

fn parse_field<T: std::str::FromStr>(
    fields: &HashMap<&str, &str>,
    key: &str,
    line: &str,
) -> Result<T> {
    let raw = fields
        .get(key)
        .ok_or_else(|| record_error(format!("missing `{key}` in {line:?}")))?;
    raw.parse()
        .map_err(|_| record_error(format!("invalid `{key}` value {raw:?} in {line:?}")))
}

fn parse_timestamp(fields: &HashMap<&str, &str>, line: &str) -> Result<FrameTimestamp> {
    if let Ok(ts) = parse_field::<u64>(fields, "timestamp", line) {
        return Ok(ts);
    }
    let value: f64 = parse_field(fields, "timestamp", line)?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        Ok(value as u64)
    } else {
        Err(record_error(format!(
            "timestamp {value} is not a whole millisecond in {line:?}"
        )))
    }
}

/// `now` in milliseconds. Players that print `time.time()` report seconds.
fn parse_wallclock(fields: &HashMap<&str, &str>, line: &str) -> Result<f64> {
    let value: f64 = parse_field(fields, "now", line)?;
    if !value.is_finite() {
        return Err(record_error(format!("wall clock {value} is not finite in {line:?}")));
    }
    if value.abs() < SECONDS_SCALE_LIMIT {
        Ok(value * 1000.0)
    } else {
        Ok(value)
    }
}

fn record_error(message: impl Into<String>) -> LatprobeError {
    LatprobeError::Record(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_line_survives_display_and_parse() {
        let record = SenderRecord {
            timestamp: 1_700_000_000_123,
            sender_wallclock_ms: 1_700_000_000_125.5,
            sender_num: 7,
            sender_count: 4000,
        };
        let line = record.to_string();
        let parsed = SenderRecord::from_line(&line).expect("parse").expect("record");
        assert_eq!(parsed, record);
    }

    #[test]
    fn receiver_line_with_log_prefix_and_float_timestamp() {
        let line = "2024-01-01T00:00:00Z DEBUG testlatency: receiver: now=1700000001050.000, num=3, timestamp=1700000001000.0, latency=50.000, pointcount=12";
        let parsed = ReceiverRecord::from_line(line).expect("parse").expect("record");
        assert_eq!(parsed.timestamp, 1_700_000_001_000);
        assert_eq!(parsed.receiver_num, 3);
        assert_eq!(parsed.receiver_count, 12);
        assert!((parsed.apparent_latency_ms() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn wallclock_in_seconds_is_scaled_to_milliseconds() {
        let sent = SenderRecord::from_line(
            "testlatency: sender: now=1700000000.0, timestamp=1700000000000, sender_num=0, sender_pointcount=4000",
        )
        .expect("parse")
        .expect("record");
        let received = ReceiverRecord::from_line(
            "testlatency: receiver: now=1700000000.05, num=0, timestamp=1700000000000, latency=0.05, pointcount=4000",
        )
        .expect("parse")
        .expect("record");
        assert_eq!(sent.timestamp, received.timestamp);
        assert!((sent.wallclock_ms() - 1_700_000_000_000.0).abs() < 1e-3);
        let latency = received.wallclock_ms() - sent.wallclock_ms();
        assert!((latency - 50.0).abs() < 1e-3, "latency {latency}");
    }

    #[test]
    fn wallclock_in_milliseconds_is_kept() {
        let sent = SenderRecord::from_line(
            "testlatency: sender: now=1700000000012.5, timestamp=1700000000000, sender_num=0, sender_pointcount=1",
        )
        .expect("parse")
        .expect("record");
        assert!((sent.sender_wallclock_ms - 1_700_000_000_012.5).abs() < 1e-3);
        assert!(SenderRecord::from_line(
            "testlatency: sender: now=inf, timestamp=1, sender_num=0, sender_pointcount=1"
        )
        .is_err());
    }

    #[test]
    fn transit_time_counts_from_capture() {
        let mut frame = Frame::new(10, 1, false);
        frame.captured_at -= chrono::Duration::milliseconds(40);
        let transit = frame.transit_ms();
        assert!((40.0..1000.0).contains(&transit), "transit {transit}");
    }

    #[test]
    fn unrelated_lines_are_skipped() {
        assert!(parse_line("Added /bin2dashSink.mpd").unwrap().is_none());
        assert!(SenderRecord::from_line("testlatency: receiver: now=1, num=0, timestamp=1, latency=0, pointcount=1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_record_line_is_an_error() {
        let err = parse_line("testlatency: sender: now=abc, timestamp=1, sender_num=0, sender_pointcount=1")
            .unwrap_err();
        assert!(matches!(err, LatprobeError::Record(_)));
        assert!(parse_line("testlatency: sender: now=1, timestamp=1.5, sender_num=0, sender_pointcount=1").is_err());
    }

    #[test]
    fn mixed_log_lines_are_classified() {
        let sender = parse_line("testlatency: sender: now=10, timestamp=10, sender_num=0, sender_pointcount=5")
            .unwrap()
            .unwrap();
        assert!(matches!(sender, RecordLine::Sender(_)));
        let receiver = parse_line("testlatency: receiver: now=60, num=0, timestamp=10, latency=50, pointcount=5")
            .unwrap()
            .unwrap();
        assert!(matches!(receiver, RecordLine::Receiver(_)));
    }
}
