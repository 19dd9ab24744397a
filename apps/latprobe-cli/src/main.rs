use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::{stream::BoxStream, StreamExt};
use latprobe_analysis::{judge, Analyser, AnalyserResults, Verdict};
use latprobe_coordinator::{run_standalone, Coordinator, CoordinatorSettings};
use latprobe_ops::{
    ensure_log_dir, init_tracing, load_record_log, load_records, write_json, EventLog,
    RECEIVER_RECORDS_FILE, REPORT_FILE, SENDER_RECORDS_FILE,
};
use latprobe_roles::{
    readiness_gate,
    transport::{loopback, LoopbackConfig},
    ExternalReceiver, ExternalSender, ReceiverRunner, RecordSource, SenderRunner, ServerRole,
    StreamReceiver, SyntheticSender, SyntheticSettings,
};
use latprobe_types::{
    config::{LatprobeConfig, RoleKind},
    events::{EventPayload, RunEvent},
    records::{ReceiverRecord, SenderRecord},
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod args;

use args::{Args, Mode, RecordInput};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    init_tracing(&config.ops)?;

    let log_dir = config
        .ops
        .log_dir
        .as_deref()
        .map(ensure_log_dir)
        .transpose()?;

    let status = match args.mode {
        Mode::All => run_all(&config, log_dir.as_deref()).await?,
        Mode::Server => run_server(&config, log_dir).await?,
        Mode::Sender => run_sender(&config, log_dir).await?,
        Mode::Receiver => run_receiver(&config, log_dir).await?,
        Mode::Analyse => run_analyse(&args, &config, log_dir.as_deref()).await?,
    };
    Ok(if status == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_config(path: Option<&Path>) -> Result<LatprobeConfig> {
    match path {
        Some(path) => LatprobeConfig::from_file(path)
            .with_context(|| format!("invalid configuration in '{}'", path.display())),
        None => Ok(LatprobeConfig::default()),
    }
}

async fn run_all(config: &LatprobeConfig, log_dir: Option<&Path>) -> Result<i32> {
    let (signal, waiter) = readiness_gate();
    let server =
        ServerRole::new(&config.server, signal).with_log_dir(log_dir.map(Path::to_path_buf));
    let (sender, receiver) = data_path_roles(config, log_dir);
    info!(
        "streaming {} point clouds via {}",
        config.sender.frame_count(),
        config.server.manifest_url()
    );

    let events = EventLog::default();
    let progress = spawn_progress(events.subscribe());
    let mut coordinator = Coordinator::new(
        CoordinatorSettings::from(config),
        server,
        sender,
        receiver,
        waiter,
        events,
    );

    let report = coordinator.run_until(shutdown_signal()).await?;
    progress.abort();

    if let Some(results) = &report.results {
        println!("{results}");
    }
    if let Some(dir) = log_dir {
        write_json(dir, SENDER_RECORDS_FILE, &report.sender_records).await?;
        write_json(dir, RECEIVER_RECORDS_FILE, &report.receiver_records).await?;
        write_json(dir, REPORT_FILE, &report).await?;
    }

    if report.passed() {
        info!("run passed");
        Ok(0)
    } else {
        for violation in &report.verdict.violations {
            error!("{violation}");
        }
        Ok(1)
    }
}

fn data_path_roles(
    config: &LatprobeConfig,
    log_dir: Option<&Path>,
) -> (Box<dyn SenderRunner>, Box<dyn ReceiverRunner>) {
    match config.sender.kind {
        RoleKind::External => {
            let sender = ExternalSender::from_config(&config.sender, &config.server)
                .with_log_dir(log_dir.map(Path::to_path_buf));
            let receiver = ExternalReceiver::from_config(&config.receiver, &config.server)
                .with_log_dir(log_dir.map(Path::to_path_buf));
            info!("sender: {}", sender.command());
            info!("receiver: {}", receiver.command());
            (Box::new(sender), Box::new(receiver))
        }
        RoleKind::InProcess => {
            let (sink, source) = loopback(LoopbackConfig::from(&config.transport));
            let sender = SyntheticSender::new(SyntheticSettings::from(&config.sender), sink);
            (Box::new(sender), Box::new(StreamReceiver::new(source)))
        }
    }
}

fn spawn_progress(mut events: BoxStream<'static, RunEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event.payload {
                EventPayload::Phase(phase) => match phase.details {
                    Some(details) => eprintln!("latprobe: {:?} ({details})", phase.to),
                    None => eprintln!("latprobe: {:?}", phase.to),
                },
                EventPayload::Role(role) => {
                    if let Some(status) = role.exit_status {
                        eprintln!("latprobe: {} exited with status {status}", role.role);
                    }
                }
                _ => {}
            }
        }
    })
}

async fn run_server(config: &LatprobeConfig, log_dir: Option<PathBuf>) -> Result<i32> {
    let (signal, mut waiter) = readiness_gate();
    let mut server = ServerRole::new(&config.server, signal).with_log_dir(log_dir);
    let timeout = Duration::from_secs(config.server.ready_timeout_secs);
    let manifest_url = config.server.manifest_url();
    let announce = tokio::spawn(async move {
        if waiter.wait_for_mpd(timeout).await {
            info!("manifest available at {manifest_url}");
        } else {
            warn!("server did not announce a manifest within {timeout:?}");
        }
    });

    info!("running {} until interrupted", server.command());
    let status = run_standalone(&mut server, shutdown_signal()).await?;
    announce.abort();
    Ok(status)
}

async fn run_sender(config: &LatprobeConfig, log_dir: Option<PathBuf>) -> Result<i32> {
    if config.sender.kind != RoleKind::External {
        bail!("an in-process sender only runs together with its receiver in --mode all");
    }
    let mut sender =
        ExternalSender::from_config(&config.sender, &config.server).with_log_dir(log_dir.clone());
    info!("running {}", sender.command());
    let status = run_standalone(&mut sender, shutdown_signal()).await?;
    let records = sender.take_records();
    info!("collected {} sender records", records.len());
    if let Some(dir) = log_dir {
        write_json(&dir, SENDER_RECORDS_FILE, &records).await?;
    }
    Ok(status)
}

async fn run_receiver(config: &LatprobeConfig, log_dir: Option<PathBuf>) -> Result<i32> {
    if config.receiver.kind != RoleKind::External {
        bail!("an in-process receiver only runs together with its sender in --mode all");
    }
    let mut receiver = ExternalReceiver::from_config(&config.receiver, &config.server)
        .with_log_dir(log_dir.clone());
    info!("running {}", receiver.command());
    let status = run_standalone(&mut receiver, shutdown_signal()).await?;
    let records = receiver.take_records();
    info!("collected {} receiver records", records.len());
    if let Some(dir) = log_dir {
        write_json(&dir, RECEIVER_RECORDS_FILE, &records).await?;
    }
    Ok(status)
}

#[derive(Serialize)]
struct AnalysisReport<'a> {
    sources: Vec<&'a Path>,
    results: &'a AnalyserResults,
    verdict: &'a Verdict,
}

async fn run_analyse(args: &Args, config: &LatprobeConfig, log_dir: Option<&Path>) -> Result<i32> {
    let Some(input) = args.record_input() else {
        bail!("--mode analyse needs --records-log or both --sender-records and --receiver-records");
    };
    let (sender, receiver, sources): (Vec<SenderRecord>, Vec<ReceiverRecord>, _) = match input {
        RecordInput::Separate { sender, receiver } => (
            load_records(sender).await?,
            load_records(receiver).await?,
            vec![sender, receiver],
        ),
        RecordInput::Combined(log) => {
            let (sender, receiver) = load_record_log(log).await?;
            (sender, receiver, vec![log])
        }
    };
    info!(
        "analysing {} sender and {} receiver records",
        sender.len(),
        receiver.len()
    );

    let results = Analyser::new(&sender, &receiver).analyse(&config.analysis);
    let verdict = judge(&results, &config.analysis.thresholds);
    println!("{results}");
    for violation in &verdict.violations {
        error!("{violation}");
    }

    if let Some(dir) = log_dir {
        let report = AnalysisReport {
            sources,
            results: &results,
            verdict: &verdict,
        };
        write_json(dir, REPORT_FILE, &report).await?;
    }
    Ok(if verdict.passed { 0 } else { 1 })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("interrupted, stopping roles"),
        Err(err) => {
            warn!("unable to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    }
}
