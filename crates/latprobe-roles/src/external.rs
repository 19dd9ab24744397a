use std::{marker::PhantomData, path::PathBuf};

use async_trait::async_trait;
use latprobe_types::{
    config::{ReceiverConfig, SenderConfig, ServerConfig},
    events::Role,
    records::{FrameRecord, ReceiverRecord, SenderRecord},
    Result,
};
use tracing::{debug, warn};

use crate::{
    process::{pump, spawn_process, CommandSpec, ScannedStream},
    task::{RoleTask, TaskOutcome},
    RecordSource, RoleRunner,
};

/// Sender or receiver run as an external executable. Record lines found on
/// the child's stderr are collected into the role's log.
pub struct ExternalRole<R> {
    role: Role,
    command: CommandSpec,
    log_dir: Option<PathBuf>,
    task: RoleTask<R>,
    _record: PhantomData<fn() -> R>,
}

pub type ExternalSender = ExternalRole<SenderRecord>;
pub type ExternalReceiver = ExternalRole<ReceiverRecord>;

impl<R: FrameRecord> ExternalRole<R> {
    pub fn new(role: Role, command: CommandSpec) -> Self {
        Self {
            role,
            command,
            log_dir: None,
            task: RoleTask::new(role),
            _record: PhantomData,
        }
    }

    pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }
}

impl ExternalSender {
    pub fn from_config(sender: &SenderConfig, server: &ServerConfig) -> Self {
        Self::new(Role::Sender, forward_command(sender, server))
    }
}

impl ExternalReceiver {
    pub fn from_config(receiver: &ReceiverConfig, server: &ServerConfig) -> Self {
        Self::new(Role::Receiver, view_command(receiver, server))
    }
}

/// Command line for the synthetic forwarder feeding the relay.
pub fn forward_command(sender: &SenderConfig, server: &ServerConfig) -> CommandSpec {
    if let Some(args) = &sender.args {
        return CommandSpec::new(sender.program.clone(), args.clone());
    }
    let mut args = vec![
        "--verbose".to_string(),
        "--count".to_string(),
        sender.frame_count().to_string(),
        "--fps".to_string(),
        sender.fps.to_string(),
        "--synthetic".to_string(),
        "--bin2dash".to_string(),
        server.ingest_url(),
    ];
    if sender.seg_dur_ms > 0 {
        args.push("--seg_dur".into());
        args.push(sender.seg_dur_ms.to_string());
    }
    if sender.timeshift_buffer_ms > 0 {
        args.push("--timeshift_buffer_ms".into());
        args.push(sender.timeshift_buffer_ms.to_string());
    }
    CommandSpec::new(sender.program.clone(), args)
}

/// Command line for the headless viewer subscribing to the manifest.
pub fn view_command(receiver: &ReceiverConfig, server: &ServerConfig) -> CommandSpec {
    let args = receiver.args.clone().unwrap_or_else(|| {
        vec![
            "--nodisplay".to_string(),
            "--sub".to_string(),
            server.manifest_url(),
        ]
    });
    CommandSpec::new(receiver.program.clone(), args)
}

#[async_trait]
impl<R: FrameRecord> RoleRunner for ExternalRole<R> {
    fn role(&self) -> Role {
        self.role
    }

    async fn start(&mut self) -> Result<()> {
        self.task.ensure_not_started()?;
        let role = self.role;
        let process = spawn_process(
            &self.command,
            role,
            ScannedStream::Stderr,
            self.log_dir.as_deref(),
        )
        .await?;
        self.task.spawn(move |shutdown| async move {
            let mut records = Vec::new();
            let status = pump(role, process, shutdown, |line| match R::from_line(line) {
                Ok(Some(record)) => {
                    debug!(role = %role, timestamp = record.timestamp(), "record");
                    records.push(record);
                }
                Ok(None) => {}
                Err(err) => warn!(role = %role, "ignoring output line: {err}"),
            })
            .await;
            TaskOutcome::new(status, records)
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

impl<R: FrameRecord> RecordSource<R> for ExternalRole<R> {
    fn take_records(&mut self) -> Vec<R> {
        self.task.take_records()
    }
}
