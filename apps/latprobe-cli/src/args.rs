use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use latprobe_types::config::{LatprobeConfig, LossMode, StdDevKind, TrimPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Run only the relay server until interrupted
    Server,
    /// Run only the sender
    Sender,
    /// Run only the receiver
    Receiver,
    /// Server, sender and receiver, then analyse
    All,
    /// Analyse record logs of an earlier run
    Analyse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LossModeArg {
    Aggregate,
    Split,
}

impl From<LossModeArg> for LossMode {
    fn from(arg: LossModeArg) -> Self {
        match arg {
            LossModeArg::Aggregate => LossMode::Aggregate,
            LossModeArg::Split => LossMode::Split,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "latprobe")]
#[command(about = "End-to-end latency harness for a point cloud streaming pipeline", long_about = None)]
#[command(version)]
pub struct Args {
    #[arg(long, value_enum, default_value = "all")]
    pub mode: Mode,

    /// TOML configuration file; flags override its values
    #[arg(long, env = "LATPROBE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seconds to stream
    #[arg(long)]
    pub duration: Option<u64>,

    #[arg(long)]
    pub fps: Option<u32>,

    /// Points per synthetic point cloud
    #[arg(long)]
    pub npoints: Option<u32>,

    /// Send point clouds without compression
    #[arg(long)]
    pub uncompressed: bool,

    /// Segment duration in milliseconds
    #[arg(long)]
    pub seg_dur: Option<u64>,

    #[arg(long)]
    pub timeshift_buffer_ms: Option<u64>,

    /// Host the relay server runs on
    #[arg(long)]
    pub server_host: Option<String>,

    /// Seconds to wait for the server to announce its manifest
    #[arg(long)]
    pub ready_timeout: Option<u64>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Trace logging
    #[arg(long)]
    pub debug: bool,

    /// Directory for role output logs, record logs and the run report
    #[arg(long)]
    pub logdir: Option<String>,

    #[arg(long, value_enum)]
    pub loss_mode: Option<LossModeArg>,

    /// Exclude this many leading latency samples from the statistics
    #[arg(long, conflicts_with = "trim_above_mean")]
    pub ignore_leading: Option<usize>,

    /// Exclude the leading run of latencies above the whole-run mean
    #[arg(long)]
    pub trim_above_mean: bool,

    /// Population instead of sample standard deviation
    #[arg(long)]
    pub population_stddev: bool,

    /// Sender record log to analyse
    #[arg(long, requires = "receiver_records", conflicts_with = "records_log")]
    pub sender_records: Option<PathBuf>,

    /// Receiver record log to analyse
    #[arg(long, requires = "sender_records", conflicts_with = "records_log")]
    pub receiver_records: Option<PathBuf>,

    /// Single text log holding both sender and receiver record lines
    #[arg(long)]
    pub records_log: Option<PathBuf>,
}

/// Where `--mode analyse` reads its records from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordInput<'a> {
    Separate { sender: &'a Path, receiver: &'a Path },
    Combined(&'a Path),
}

impl Args {
    pub fn record_input(&self) -> Option<RecordInput<'_>> {
        if let Some(log) = &self.records_log {
            return Some(RecordInput::Combined(log));
        }
        match (&self.sender_records, &self.receiver_records) {
            (Some(sender), Some(receiver)) => Some(RecordInput::Separate { sender, receiver }),
            _ => None,
        }
    }

    /// Fold the command-line overrides into `config`.
    pub fn apply(&self, config: &mut LatprobeConfig) {
        if let Some(duration) = self.duration {
            config.sender.duration_secs = duration;
        }
        if let Some(fps) = self.fps {
            config.sender.fps = fps;
        }
        if let Some(npoints) = self.npoints {
            config.sender.npoints = npoints;
        }
        if self.uncompressed {
            config.sender.uncompressed = true;
        }
        if let Some(seg_dur) = self.seg_dur {
            config.sender.seg_dur_ms = seg_dur;
        }
        if let Some(timeshift) = self.timeshift_buffer_ms {
            config.sender.timeshift_buffer_ms = timeshift;
        }
        if let Some(host) = &self.server_host {
            config.server.host = host.clone();
        }
        if let Some(timeout) = self.ready_timeout {
            config.server.ready_timeout_secs = timeout;
        }

        if self.debug {
            config.ops.log_level = "trace".into();
        } else if self.verbose {
            config.ops.log_level = "debug".into();
        }
        if let Some(dir) = &self.logdir {
            config.ops.log_dir = Some(dir.clone());
        }

        if let Some(mode) = self.loss_mode {
            config.analysis.loss_mode = mode.into();
        }
        if let Some(count) = self.ignore_leading {
            config.analysis.trim = TrimPolicy::Leading { count };
        } else if self.trim_above_mean {
            config.analysis.trim = TrimPolicy::AboveMean;
        }
        if self.population_stddev {
            config.analysis.stddev = StdDevKind::Population;
        }
    }
}
