use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three processes or tasks that make up one measurement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinator lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    ServerStarting,
    WaitingForReady,
    Streaming,
    Draining,
    Analysed,
    Passed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Passed | RunPhase::Failed)
    }
}

/// High-level event kinds emitted during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Lifecycle,
    Role,
    Readiness,
    Analysis,
}

/// Immutable event envelope for logging and the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Phase(PhaseEvent),
    Role(RoleEvent),
    Readiness(ReadinessEvent),
    Analysis(AnalysisEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub from: RunPhase,
    pub to: RunPhase,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEvent {
    pub role: Role,
    pub action: RoleAction,
    pub exit_status: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleAction {
    Started,
    StopRequested,
    Exited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessEvent {
    pub ready: bool,
    pub waited_ms: u64,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisEvent {
    pub passed: bool,
    pub summary: String,
}

impl RunEvent {
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn phase(from: RunPhase, to: RunPhase, details: Option<String>) -> Self {
        Self::new(
            EventKind::Lifecycle,
            EventPayload::Phase(PhaseEvent { from, to, details }),
        )
    }

    pub fn role(role: Role, action: RoleAction, exit_status: Option<i32>) -> Self {
        Self::new(
            EventKind::Role,
            EventPayload::Role(RoleEvent {
                role,
                action,
                exit_status,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_events_serialize_with_lowercase_roles() {
        let event = RunEvent::role(Role::Receiver, RoleAction::Exited, Some(0));
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["kind"], "Role");
        assert_eq!(json["payload"]["Role"]["role"], "receiver");
        assert_eq!(json["payload"]["Role"]["exit_status"], 0);
    }

    #[test]
    fn only_verdicts_are_terminal() {
        assert!(RunPhase::Passed.is_terminal());
        assert!(RunPhase::Failed.is_terminal());
        assert!(!RunPhase::Analysed.is_terminal());
        assert!(!RunPhase::Idle.is_terminal());
    }
}
