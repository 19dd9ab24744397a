//! Operational helpers: logging, the run event log, and persistence of
//! records and reports.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::{stream::BoxStream, StreamExt};
use latprobe_types::{
    config::OpsConfig,
    events::RunEvent,
    records::{parse_line, FrameRecord, ReceiverRecord, RecordLine, SenderRecord},
    LatprobeError, Result,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

pub const SENDER_RECORDS_FILE: &str = "sender-records.json";
pub const RECEIVER_RECORDS_FILE: &str = "receiver-records.json";
pub const REPORT_FILE: &str = "report.json";

pub fn init_tracing(config: &OpsConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.log_level.clone())
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| ops_error(format!("failed to create log filter: {err}")))?;

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| ops_error(format!("tracing init error: {err}")))?;
    Ok(())
}

/// Append-only log of run events with live subscription.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<RunEvent>>>,
    tx: broadcast::Sender<RunEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            tx,
        }
    }

    pub async fn record(&self, event: RunEvent) -> Result<()> {
        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
        self.events.lock().await.push(event);
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<RunEvent> {
        self.events.lock().await.clone()
    }

    pub fn subscribe(&self) -> BoxStream<'static, RunEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }
}

pub fn ensure_log_dir(path: &str) -> Result<PathBuf> {
    let dir = PathBuf::from(path);
    std::fs::create_dir_all(&dir)
        .map_err(|err| ops_error(format!("failed to create log dir {}: {err}", dir.display())))?;
    info!("Log directory ready at {:?}", dir);
    Ok(dir)
}

/// Pretty-print `value` as JSON into `dir/name`.
pub async fn write_json<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> Result<PathBuf> {
    let path = dir.join(name);
    let body = serde_json::to_vec_pretty(value)
        .map_err(|err| ops_error(format!("failed to serialize {name}: {err}")))?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|err| ops_error(format!("failed to write {}: {err}", path.display())))?;
    info!("wrote {}", path.display());
    Ok(path)
}

/// Load a record log: either a JSON array written by [`write_json`] or a
/// text log containing record lines, from which records are scraped.
pub async fn load_records<R>(path: &Path) -> Result<Vec<R>>
where
    R: FrameRecord + DeserializeOwned,
{
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| ops_error(format!("failed to read {}: {err}", path.display())))?;
    if contents.trim_start().starts_with('[') {
        return serde_json::from_str(&contents)
            .map_err(|err| ops_error(format!("failed to parse {}: {err}", path.display())));
    }
    let mut records = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        match R::from_line(line) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(err) => warn!("{}:{}: skipping line: {err}", path.display(), lineno + 1),
        }
    }
    Ok(records)
}

/// Split one text log holding both sender and receiver record lines, as
/// written when both players share a terminal, into its two sides.
pub async fn load_record_log(path: &Path) -> Result<(Vec<SenderRecord>, Vec<ReceiverRecord>)> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| ops_error(format!("failed to read {}: {err}", path.display())))?;
    let mut sender = Vec::new();
    let mut receiver = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(RecordLine::Sender(record))) => sender.push(record),
            Ok(Some(RecordLine::Receiver(record))) => receiver.push(record),
            Ok(None) => {}
            Err(err) => warn!("{}:{}: skipping line: {err}", path.display(), lineno + 1),
        }
    }
    Ok((sender, receiver))
}

pub fn ops_error(message: impl Into<String>) -> LatprobeError {
    LatprobeError::Ops(message.into())
}
