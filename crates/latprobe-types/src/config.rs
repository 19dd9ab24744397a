use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{LatprobeError, Result};

/// Whether a data-path role runs as an external executable or in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    External,
    InProcess,
}

/// How the coordinator decides the server's manifest is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// Scan server output for a line carrying every readiness token.
    Marker,
    /// Sleep for `seg_dur_ms * multiplier`, bounded by the ready timeout.
    SegmentDelay { multiplier: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub program: String,
    /// Extra arguments. `--port <port>` is appended unless already present.
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub manifest_name: String,
    pub readiness: ReadinessPolicy,
    pub ready_tokens: Vec<String>,
    pub ready_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: "evanescent.exe".into(),
            args: Vec::new(),
            host: "127.0.0.1".into(),
            port: 9000,
            manifest_name: "bin2dashSink.mpd".into(),
            readiness: ReadinessPolicy::Marker,
            ready_tokens: vec!["Added".into(), ".mpd".into()],
            ready_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// URL the sender pushes segments to.
    pub fn ingest_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }

    /// URL of the manifest the receiver subscribes to.
    pub fn manifest_url(&self) -> String {
        format!("{}{}", self.ingest_url(), self.manifest_name)
    }

    /// Arguments the server is launched with; always listens on `port`.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if self.args_port().is_none() {
            args.push("--port".into());
            args.push(self.port.to_string());
        }
        args
    }

    /// Port given explicitly in `args`, as `--port N` or `--port=N`.
    fn args_port(&self) -> Option<&str> {
        self.args.iter().enumerate().find_map(|(idx, arg)| {
            if arg == "--port" {
                Some(self.args.get(idx + 1).map(String::as_str).unwrap_or(""))
            } else {
                arg.strip_prefix("--port=")
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub kind: RoleKind,
    pub program: String,
    /// Full argument list; built from the other fields when absent.
    pub args: Option<Vec<String>>,
    pub duration_secs: u64,
    pub fps: u32,
    pub npoints: u32,
    pub uncompressed: bool,
    /// Segment duration handed to the packager; 0 leaves it to the packager.
    pub seg_dur_ms: u64,
    pub timeshift_buffer_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            kind: RoleKind::External,
            program: "cwipc_forward".into(),
            args: None,
            duration_secs: 30,
            fps: 15,
            npoints: 10_000,
            uncompressed: false,
            seg_dur_ms: 0,
            timeshift_buffer_ms: 0,
        }
    }
}

impl SenderConfig {
    pub fn frame_count(&self) -> u64 {
        self.duration_secs * u64::from(self.fps)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub kind: RoleKind,
    pub program: String,
    pub args: Option<Vec<String>>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            kind: RoleKind::External,
            program: "cwipc_view".into(),
            args: None,
        }
    }
}

/// In-process loopback transport used when both data-path roles run in-process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub delay_ms: u64,
    /// Drop every Nth frame fed to the sink.
    pub drop_every: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossMode {
    #[default]
    Aggregate,
    /// Split loss into frames lost before the first match and after it.
    Split,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdDevKind {
    Population,
    #[default]
    Sample,
}

/// Which leading latency samples to discard before computing aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrimPolicy {
    #[default]
    None,
    Leading { count: usize },
    /// Heuristic: drop the leading run of samples above the whole-run mean,
    /// treating it as pipeline ramp-up.
    AboveMean,
}

/// Acceptance limits; unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub max_lost: Option<u64>,
    pub max_initial_lost: Option<u64>,
    pub max_running_lost: Option<u64>,
    pub max_loss_ratio: Option<f64>,
    pub min_matched: Option<u64>,
    pub max_latency_avg_ms: Option<f64>,
    pub max_latency_max_ms: Option<f64>,
    pub max_latency_stddev_ms: Option<f64>,
    pub max_jitter_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub loss_mode: LossMode,
    pub trim: TrimPolicy,
    pub stddev: StdDevKind,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub log_level: String,
    pub log_dir: Option<String>,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LatprobeConfig {
    pub server: ServerConfig,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
    pub transport: TransportConfig,
    pub analysis: AnalysisConfig,
    pub ops: OpsConfig,
}

impl LatprobeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            LatprobeError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|err| {
            LatprobeError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.sender.fps == 0 {
            return Err(config_error("sender.fps must be greater than zero"));
        }
        if self.sender.duration_secs == 0 {
            return Err(config_error("sender.duration_secs must be greater than zero"));
        }
        if self.server.ready_timeout_secs == 0 {
            return Err(config_error(
                "server.ready_timeout_secs must be greater than zero",
            ));
        }
        match self.server.readiness {
            ReadinessPolicy::Marker if self.server.ready_tokens.is_empty() => {
                return Err(config_error(
                    "server.ready_tokens must not be empty for the marker readiness policy",
                ));
            }
            ReadinessPolicy::SegmentDelay { multiplier } if multiplier == 0 => {
                return Err(config_error(
                    "server.readiness.multiplier must be greater than zero",
                ));
            }
            _ => {}
        }
        if let Some(port) = self.server.args_port() {
            if port != self.server.port.to_string() {
                return Err(config_error(&format!(
                    "server.args listen on port {port:?} but server.port is {}",
                    self.server.port
                )));
            }
        }
        if self.sender.kind != self.receiver.kind {
            return Err(config_error(
                "sender.kind and receiver.kind must match: in-process roles only talk over the loopback transport",
            ));
        }
        if self.transport.drop_every == Some(0) || self.transport.drop_every == Some(1) {
            return Err(config_error(
                "transport.drop_every must be at least 2 (or unset)",
            ));
        }
        let thresholds = &self.analysis.thresholds;
        if let Some(ratio) = thresholds.max_loss_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(config_error(
                    "analysis.thresholds.max_loss_ratio must be between 0.0 and 1.0",
                ));
            }
        }
        let latency_limits = [
            thresholds.max_latency_avg_ms,
            thresholds.max_latency_max_ms,
            thresholds.max_latency_stddev_ms,
            thresholds.max_jitter_ms,
        ];
        if latency_limits.iter().flatten().any(|limit| *limit < 0.0) {
            return Err(config_error(
                "analysis.thresholds latency limits must not be negative",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> LatprobeError {
    LatprobeError::Configuration(message.into())
}
