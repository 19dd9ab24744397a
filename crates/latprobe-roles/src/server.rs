use std::path::PathBuf;

use async_trait::async_trait;
use latprobe_types::{config::ServerConfig, events::Role, Result};

use crate::{
    process::{pump, spawn_process, CommandSpec, ScannedStream},
    readiness::{ReadinessScanner, ReadinessSignal},
    role_error,
    task::{RoleTask, TaskOutcome},
    RoleRunner,
};

/// Wrapper around the relay executable. Scans stdout for the manifest
/// announcement and fires the readiness signal on the first match.
pub struct ServerRole {
    command: CommandSpec,
    ready_tokens: Vec<String>,
    signal: Option<ReadinessSignal>,
    log_dir: Option<PathBuf>,
    task: RoleTask<()>,
}

impl ServerRole {
    pub fn new(config: &ServerConfig, signal: ReadinessSignal) -> Self {
        Self::with_command(
            CommandSpec::new(config.program.clone(), config.command_args()),
            config.ready_tokens.clone(),
            signal,
        )
    }

    pub fn with_command(
        command: CommandSpec,
        ready_tokens: Vec<String>,
        signal: ReadinessSignal,
    ) -> Self {
        Self {
            command,
            ready_tokens,
            signal: Some(signal),
            log_dir: None,
            task: RoleTask::new(Role::Server),
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

#[async_trait]
impl RoleRunner for ServerRole {
    fn role(&self) -> Role {
        Role::Server
    }

    async fn start(&mut self) -> Result<()> {
        self.task.ensure_not_started()?;
        let signal = self
            .signal
            .take()
            .ok_or_else(|| role_error("server readiness signal already consumed"))?;
        let process = spawn_process(
            &self.command,
            Role::Server,
            ScannedStream::Stdout,
            self.log_dir.as_deref(),
        )
        .await?;
        let mut scanner = ReadinessScanner::new(self.ready_tokens.clone(), signal);
        self.task.spawn(move |shutdown| async move {
            let status = pump(Role::Server, process, shutdown, |line| {
                scanner.observe(line);
            })
            .await;
            TaskOutcome::new(status, Vec::new())
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
