//! Run coordinator: starts the relay and the sender, gates the receiver on
//! manifest readiness, drains the run and judges the collected records.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use latprobe_analysis::{judge, Analyser, AnalyserResults, Verdict};
use latprobe_ops::EventLog;
use latprobe_roles::{Readiness, ReadinessWaiter, ReceiverRunner, RoleRunner, SenderRunner};
use latprobe_types::{
    config::{AnalysisConfig, LatprobeConfig, ReadinessPolicy},
    events::{
        AnalysisEvent, EventKind, EventPayload, ReadinessEvent, Role, RoleAction, RunEvent,
        RunPhase,
    },
    records::{ReceiverRecord, SenderRecord},
    LatprobeError, Result,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

mod state;

pub use state::RunStateMachine;

/// Segment duration assumed for the delay readiness policy when the sender
/// leaves it to the packager.
pub const DEFAULT_SEGMENT_DURATION_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub readiness: ReadinessPolicy,
    pub ready_timeout: Duration,
    pub seg_dur_ms: u64,
    pub analysis: AnalysisConfig,
}

impl From<&LatprobeConfig> for CoordinatorSettings {
    fn from(config: &LatprobeConfig) -> Self {
        Self {
            readiness: config.server.readiness.clone(),
            ready_timeout: Duration::from_secs(config.server.ready_timeout_secs),
            seg_dur_ms: config.sender.seg_dur_ms,
            analysis: config.analysis.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleStatuses {
    pub server: Option<i32>,
    pub sender: Option<i32>,
    pub receiver: Option<i32>,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: RunPhase,
    pub statuses: RoleStatuses,
    pub results: Option<AnalyserResults>,
    pub verdict: Verdict,
    pub events: Vec<RunEvent>,
    #[serde(skip)]
    pub sender_records: Vec<SenderRecord>,
    #[serde(skip)]
    pub receiver_records: Vec<ReceiverRecord>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.phase == RunPhase::Passed
    }
}

pub struct Coordinator<S, T, R>
where
    S: RoleRunner,
    T: SenderRunner,
    R: ReceiverRunner,
{
    settings: CoordinatorSettings,
    server: S,
    sender: T,
    receiver: R,
    readiness: ReadinessWaiter,
    events: EventLog,
    state: RunStateMachine,
    started: Vec<Role>,
}

impl<S, T, R> Coordinator<S, T, R>
where
    S: RoleRunner,
    T: SenderRunner,
    R: ReceiverRunner,
{
    /// `readiness` must be the waiter paired with the signal handed to `server`.
    pub fn new(
        settings: CoordinatorSettings,
        server: S,
        sender: T,
        receiver: R,
        readiness: ReadinessWaiter,
        events: EventLog,
    ) -> Self {
        Self {
            settings,
            server,
            sender,
            receiver,
            readiness,
            events,
            state: RunStateMachine::new(),
            started: Vec::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.state.current()
    }

    pub fn roles(&self) -> (&S, &T, &R) {
        (&self.server, &self.sender, &self.receiver)
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub async fn run(&mut self) -> Result<RunReport> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`Coordinator::run`], but when `shutdown` resolves first every
    /// started role is stopped and joined and the run fails as interrupted.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        let started_at = Utc::now();
        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            outcome = self.execute() => Some(outcome?),
            _ = &mut shutdown => None,
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => self.interrupt().await?,
        };

        let sender_records = self.sender.take_records();
        let receiver_records = self.receiver.take_records();
        let statuses = RoleStatuses {
            server: self.server.exit_status(),
            sender: self.sender.exit_status(),
            receiver: self.receiver.exit_status(),
        };

        let (results, verdict) = match outcome {
            Err(reason) => (None, Verdict::fail(reason)),
            Ok(()) => {
                self.advance(RunPhase::Analysed, None).await?;
                let results = Analyser::new(&sender_records, &receiver_records)
                    .analyse(&self.settings.analysis);
                info!("{results}");
                let mut verdict = judge(&results, &self.settings.analysis.thresholds);
                for (role, status) in [
                    (Role::Server, statuses.server),
                    (Role::Sender, statuses.sender),
                    (Role::Receiver, statuses.receiver),
                ] {
                    if status != Some(0) {
                        warn!("{role} exited with exit status code {status:?}");
                        verdict.add_violation(format!("{role} exited with status {status:?}"));
                    }
                }
                let final_phase = if verdict.passed {
                    RunPhase::Passed
                } else {
                    RunPhase::Failed
                };
                self.events
                    .record(RunEvent::new(
                        EventKind::Analysis,
                        EventPayload::Analysis(AnalysisEvent {
                            passed: verdict.passed,
                            summary: results.to_string(),
                        }),
                    ))
                    .await?;
                self.advance(final_phase, verdict.violations.first().cloned())
                    .await?;
                (Some(results), verdict)
            }
        };

        if !verdict.passed {
            warn!("run failed: {}", verdict.violations.join("; "));
        }

        Ok(RunReport {
            started_at,
            finished_at: Utc::now(),
            phase: self.state.current(),
            statuses,
            results,
            verdict,
            events: self.events.snapshot().await,
            sender_records,
            receiver_records,
        })
    }

    /// Drive the roles through a run. The inner `Err` is an aborted run with
    /// its reason; the outer one is a coordinator fault.
    async fn execute(&mut self) -> Result<Result<(), String>> {
        self.advance(RunPhase::ServerStarting, None).await?;
        info!("starting server and sender");
        if let Err(err) = self.server.start().await {
            return self.abort(format!("server failed to start: {err}")).await;
        }
        self.mark_started(Role::Server).await?;
        if let Err(err) = self.sender.start().await {
            return self.abort(format!("sender failed to start: {err}")).await;
        }
        self.mark_started(Role::Sender).await?;

        self.advance(RunPhase::WaitingForReady, None).await?;
        let waited = Instant::now();
        let readiness = self.await_readiness().await;
        let details = match &readiness {
            Readiness::Ready(line) => Some(line.clone()),
            Readiness::TimedOut => None,
            Readiness::Closed => Some("server output closed".into()),
        };
        self.events
            .record(RunEvent::new(
                EventKind::Readiness,
                EventPayload::Readiness(ReadinessEvent {
                    ready: readiness.is_ready(),
                    waited_ms: waited.elapsed().as_millis() as u64,
                    details,
                }),
            ))
            .await?;
        match readiness {
            Readiness::Ready(_) => {}
            Readiness::TimedOut => {
                return self
                    .abort(format!(
                        "server did not announce the manifest within {:?}",
                        self.settings.ready_timeout
                    ))
                    .await;
            }
            Readiness::Closed => {
                return self
                    .abort("server exited before announcing the manifest".into())
                    .await;
            }
        }
        if self.server.is_finished() {
            return self
                .abort("server exited before the receiver started".into())
                .await;
        }
        if self.sender.is_finished() {
            return self
                .abort("sender exited before the receiver started".into())
                .await;
        }

        self.advance(RunPhase::Streaming, None).await?;
        info!("starting receiver");
        if let Err(err) = self.receiver.start().await {
            return self.abort(format!("receiver failed to start: {err}")).await;
        }
        self.mark_started(Role::Receiver).await?;

        info!("waiting for sender and receiver to finish");
        let (sender_status, receiver_status) =
            tokio::join!(self.sender.join(), self.receiver.join());
        self.mark_exited(Role::Sender, sender_status?).await?;
        self.mark_exited(Role::Receiver, receiver_status?).await?;

        self.advance(RunPhase::Draining, None).await?;
        info!("stopping server");
        self.stop_and_join(Role::Server).await?;
        Ok(Ok(()))
    }

    async fn await_readiness(&mut self) -> Readiness {
        let timeout = self.settings.ready_timeout;
        match self.settings.readiness {
            ReadinessPolicy::Marker => self.readiness.wait(timeout).await,
            ReadinessPolicy::SegmentDelay { multiplier } => {
                let segment_ms = if self.settings.seg_dur_ms > 0 {
                    self.settings.seg_dur_ms
                } else {
                    DEFAULT_SEGMENT_DURATION_MS
                };
                let delay =
                    Duration::from_millis(segment_ms * u64::from(multiplier)).min(timeout);
                match self.readiness.wait(delay).await {
                    Readiness::Closed => Readiness::Closed,
                    Readiness::Ready(line) => Readiness::Ready(line),
                    Readiness::TimedOut => {
                        Readiness::Ready(format!("assumed after {}ms", delay.as_millis()))
                    }
                }
            }
        }
    }

    async fn interrupt(&mut self) -> Result<Result<(), String>> {
        let reason = String::from("run interrupted");
        if self.state.current().is_terminal() {
            return Ok(Err(reason));
        }
        self.abort(reason).await
    }

    /// Stop every role that was started, newest first, and fail the run.
    async fn abort(&mut self, reason: String) -> Result<Result<(), String>> {
        warn!("aborting run: {reason}");
        for role in [Role::Receiver, Role::Sender, Role::Server] {
            if self.started.contains(&role) {
                self.stop_and_join(role).await?;
            }
        }
        self.advance(RunPhase::Failed, Some(reason.clone())).await?;
        Ok(Err(reason))
    }

    async fn stop_and_join(&mut self, role: Role) -> Result<()> {
        let runner: &mut dyn RoleRunner = match role {
            Role::Server => &mut self.server,
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        };
        if runner.exit_status().is_none() {
            runner.stop().await?;
            self.events
                .record(RunEvent::role(role, RoleAction::StopRequested, None))
                .await?;
        }
        let runner: &mut dyn RoleRunner = match role {
            Role::Server => &mut self.server,
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        };
        let status = runner.join().await?;
        self.mark_exited(role, status).await
    }

    async fn mark_started(&mut self, role: Role) -> Result<()> {
        self.started.push(role);
        self.events
            .record(RunEvent::role(role, RoleAction::Started, None))
            .await
    }

    async fn mark_exited(&mut self, role: Role, status: i32) -> Result<()> {
        info!("{role} finished with exit status {status}");
        self.events
            .record(RunEvent::role(role, RoleAction::Exited, Some(status)))
            .await
    }

    async fn advance(&mut self, to: RunPhase, details: Option<String>) -> Result<()> {
        let from = self.state.transition(to)?;
        info!(?from, ?to, "run phase");
        self.events.record(RunEvent::phase(from, to, details)).await
    }
}

/// Run a single role on its own until it exits or `shutdown` resolves, in
/// which case it is asked to stop first. Returns the role's exit status.
pub async fn run_standalone<Q, F>(role: &mut Q, shutdown: F) -> Result<i32>
where
    Q: RoleRunner + ?Sized,
    F: Future<Output = ()>,
{
    role.start().await?;
    tokio::pin!(shutdown);
    let finished = {
        let join = role.join();
        tokio::pin!(join);
        tokio::select! {
            status = &mut join => Some(status?),
            _ = &mut shutdown => None,
        }
    };
    match finished {
        Some(status) => Ok(status),
        None => {
            info!("{} interrupted, stopping", role.role());
            role.stop().await?;
            role.join().await
        }
    }
}

pub fn coordinator_error(message: impl Into<String>) -> LatprobeError {
    LatprobeError::Coordinator(message.into())
}
