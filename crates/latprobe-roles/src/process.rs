//! Child-process plumbing shared by the external roles.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use latprobe_types::{events::Role, Result};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::watch,
};
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tracing::{debug, warn};

use crate::{normalize_exit_status, role_error, TASK_FAILURE_STATUS};

type OutputLines = LinesStream<BufReader<Box<dyn AsyncRead + Unpin + Send>>>;

/// Program plus arguments for an external role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Which output stream of the child is scanned line by line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannedStream {
    Stdout,
    Stderr,
}

impl ScannedStream {
    fn as_str(&self) -> &'static str {
        match self {
            ScannedStream::Stdout => "stdout",
            ScannedStream::Stderr => "stderr",
        }
    }

    fn other(&self) -> ScannedStream {
        match self {
            ScannedStream::Stdout => ScannedStream::Stderr,
            ScannedStream::Stderr => ScannedStream::Stdout,
        }
    }
}

/// Path of the log file one stream of a role is redirected to.
pub fn role_log_path(dir: &Path, role: Role, stream: ScannedStream) -> PathBuf {
    dir.join(format!("{role}.{}.log", stream.as_str()))
}

/// A running child with its scanned stream wrapped as lines.
pub(crate) struct SpawnedProcess {
    pub child: Child,
    pub lines: OutputLines,
    pub tee: Option<File>,
}

/// Spawn `spec`, piping the scanned stream. With a log directory the other
/// stream goes straight to its log file and the scanned one is teed there
/// by the pump; without one the other stream is inherited.
pub(crate) async fn spawn_process(
    spec: &CommandSpec,
    role: Role,
    scanned: ScannedStream,
    log_dir: Option<&Path>,
) -> Result<SpawnedProcess> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let passthrough = match log_dir {
        Some(dir) => {
            let path = role_log_path(dir, role, scanned.other());
            let file = std::fs::File::create(&path).map_err(|err| {
                role_error(format!("cannot create log file {}: {err}", path.display()))
            })?;
            Stdio::from(file)
        }
        None => Stdio::inherit(),
    };
    match scanned {
        ScannedStream::Stdout => command.stdout(Stdio::piped()).stderr(passthrough),
        ScannedStream::Stderr => command.stderr(Stdio::piped()).stdout(passthrough),
    };

    let mut child = command
        .spawn()
        .map_err(|err| role_error(format!("failed to launch {role} ({spec}): {err}")))?;

    let reader: Box<dyn AsyncRead + Unpin + Send> = match scanned {
        ScannedStream::Stdout => match child.stdout.take() {
            Some(stdout) => Box::new(stdout),
            None => return Err(role_error(format!("{role} stdout was not captured"))),
        },
        ScannedStream::Stderr => match child.stderr.take() {
            Some(stderr) => Box::new(stderr),
            None => return Err(role_error(format!("{role} stderr was not captured"))),
        },
    };

    let tee = match log_dir {
        Some(dir) => {
            let path = role_log_path(dir, role, scanned);
            Some(File::create(&path).await.map_err(|err| {
                role_error(format!("cannot create log file {}: {err}", path.display()))
            })?)
        }
        None => None,
    };

    debug!(role = %role, pid = ?child.id(), "spawned {spec}");
    Ok(SpawnedProcess {
        child,
        lines: LinesStream::new(BufReader::new(reader).lines()),
        tee,
    })
}

/// Drive a child to completion: hand every scanned line to `on_line`, honour
/// the shutdown flag by signalling the child, and return its normalized status.
pub(crate) async fn pump<F>(
    role: Role,
    process: SpawnedProcess,
    mut shutdown: watch::Receiver<bool>,
    mut on_line: F,
) -> i32
where
    F: FnMut(&str) + Send,
{
    let SpawnedProcess {
        mut child,
        mut lines,
        mut tee,
    } = process;
    let mut stop_handled = false;

    loop {
        tokio::select! {
            next = lines.next() => match next {
                Some(Ok(line)) => {
                    let line = line.trim_end();
                    debug!(role = %role, "output: {line}");
                    if let Some(file) = tee.as_mut() {
                        if let Err(err) = write_line(file, line).await {
                            warn!(role = %role, "log tee failed, disabling: {err}");
                            tee = None;
                        }
                    }
                    on_line(line);
                }
                Some(Err(err)) => {
                    warn!(role = %role, "error reading output: {err}");
                    break;
                }
                None => break,
            },
            changed = shutdown.changed(), if !stop_handled => {
                stop_handled = true;
                // A dropped flag means the owning role is gone.
                if changed.is_err() || *shutdown.borrow() {
                    terminate(&mut child, role);
                }
            }
        }
    }

    if let Some(file) = tee.as_mut() {
        let _ = file.flush().await;
    }

    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => {
                        let signal = exit_signal(&status);
                        let normalized = normalize_exit_status(status.code(), signal);
                        debug!(role = %role, "process exited with {status}, reported as {normalized}");
                        normalized
                    }
                    Err(err) => {
                        warn!(role = %role, "failed waiting for process: {err}");
                        TASK_FAILURE_STATUS
                    }
                };
            }
            changed = shutdown.changed(), if !stop_handled => {
                stop_handled = true;
                // A dropped flag means the owning role is gone.
                if changed.is_err() || *shutdown.borrow() {
                    terminate(&mut child, role);
                }
            }
        }
    }
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn terminate(child: &mut Child, role: Role) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    let Some(pid) = child.id() else {
        return;
    };
    debug!(role = %role, pid, "sending SIGTERM");
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(role = %role, "SIGTERM failed ({err}), killing instead");
        if let Err(err) = child.start_kill() {
            warn!(role = %role, "kill failed: {err}");
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, role: Role) {
    debug!(role = %role, "killing process");
    if let Err(err) = child.start_kill() {
        warn!(role = %role, "kill failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_spec_renders_as_shell_line() {
        let spec = CommandSpec::new("evanescent.exe", vec!["--port".into(), "9000".into()]);
        assert_eq!(spec.to_string(), "evanescent.exe --port 9000");
    }

    #[test]
    fn log_files_are_named_after_role_and_stream() {
        let dir = Path::new("/tmp/run");
        assert_eq!(
            role_log_path(dir, Role::Server, ScannedStream::Stdout),
            PathBuf::from("/tmp/run/server.stdout.log")
        );
        assert_eq!(
            role_log_path(dir, Role::Receiver, ScannedStream::Stderr),
            PathBuf::from("/tmp/run/receiver.stderr.log")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pump_collects_lines_and_exit_code() {
        let spec = CommandSpec::new("sh", vec!["-c".into(), "echo one; echo two; exit 3".into()]);
        let process = spawn_process(&spec, Role::Sender, ScannedStream::Stdout, None)
            .await
            .expect("spawn sh");
        let (_tx, rx) = watch::channel(false);
        let mut seen = Vec::new();
        let status = pump(Role::Sender, process, rx, |line| seen.push(line.to_string())).await;
        assert_eq!(status, 3);
        assert_eq!(seen, vec!["one".to_string(), "two".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_request_terminates_and_normalizes() {
        let spec = CommandSpec::new("sh", vec!["-c".into(), "echo up; exec sleep 30".into()]);
        let process = spawn_process(&spec, Role::Server, ScannedStream::Stdout, None)
            .await
            .expect("spawn sh");
        let (tx, rx) = watch::channel(false);
        let pump = tokio::spawn(pump(Role::Server, process, rx, |_| {}));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).expect("send stop");
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), pump)
            .await
            .expect("pump finished")
            .expect("pump task");
        assert_eq!(status, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropped_owner_terminates_child() {
        let spec = CommandSpec::new("sh", vec!["-c".into(), "exec sleep 30".into()]);
        let process = spawn_process(&spec, Role::Sender, ScannedStream::Stdout, None)
            .await
            .expect("spawn sh");
        let (tx, rx) = watch::channel(false);
        let pump = tokio::spawn(pump(Role::Sender, process, rx, |_| {}));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        drop(tx);
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), pump)
            .await
            .expect("pump finished")
            .expect("pump task");
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let spec = CommandSpec::new("latprobe-no-such-program", Vec::new());
        let result = spawn_process(&spec, Role::Receiver, ScannedStream::Stderr, None).await;
        assert!(result.is_err());
    }
}
