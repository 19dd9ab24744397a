use latprobe_types::{events::RunPhase, Result};

use crate::coordinator_error;

/// Guards the coordinator's phase progression.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    phase: RunPhase,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
        }
    }

    pub fn current(&self) -> RunPhase {
        self.phase
    }

    /// Move to `to`, returning the phase left behind.
    pub fn transition(&mut self, to: RunPhase) -> Result<RunPhase> {
        let from = self.phase;
        let allowed = match (from, to) {
            (RunPhase::Idle, RunPhase::ServerStarting)
            | (RunPhase::ServerStarting, RunPhase::WaitingForReady)
            | (RunPhase::WaitingForReady, RunPhase::Streaming)
            | (RunPhase::Streaming, RunPhase::Draining)
            | (RunPhase::Draining, RunPhase::Analysed)
            | (RunPhase::Analysed, RunPhase::Passed) => true,
            // Any live phase can fail.
            (from, RunPhase::Failed) => !from.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(coordinator_error(format!(
                "cannot move from {from:?} to {to:?}"
            )));
        }
        self.phase = to;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_passed() {
        let mut sm = RunStateMachine::new();
        assert_eq!(sm.current(), RunPhase::Idle);
        for phase in [
            RunPhase::ServerStarting,
            RunPhase::WaitingForReady,
            RunPhase::Streaming,
            RunPhase::Draining,
            RunPhase::Analysed,
            RunPhase::Passed,
        ] {
            sm.transition(phase).expect("valid transition");
        }
        assert_eq!(sm.current(), RunPhase::Passed);
        assert!(sm.transition(RunPhase::Failed).is_err());
    }

    #[test]
    fn failure_is_reachable_from_live_phases() {
        let mut sm = RunStateMachine::new();
        sm.transition(RunPhase::ServerStarting).unwrap();
        sm.transition(RunPhase::WaitingForReady).unwrap();
        assert_eq!(
            sm.transition(RunPhase::Failed).unwrap(),
            RunPhase::WaitingForReady
        );
        assert!(sm.transition(RunPhase::Streaming).is_err());
    }

    #[test]
    fn phases_cannot_be_skipped() {
        let mut sm = RunStateMachine::new();
        assert!(sm.transition(RunPhase::Streaming).is_err());
        sm.transition(RunPhase::ServerStarting).unwrap();
        assert!(sm.transition(RunPhase::Analysed).is_err());
        assert_eq!(sm.current(), RunPhase::ServerStarting);
    }
}
