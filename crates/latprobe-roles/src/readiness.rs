//! Single-fire readiness gate between the server role and the coordinator.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info};

/// Create a connected signal/waiter pair. The signal fires at most once.
pub fn readiness_gate() -> (ReadinessSignal, ReadinessWaiter) {
    let (tx, rx) = oneshot::channel();
    (
        ReadinessSignal { tx: Some(tx) },
        ReadinessWaiter {
            rx: Some(rx),
            observed: None,
        },
    )
}

/// Outcome of waiting on the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The signal fired; carries the line that triggered it.
    Ready(String),
    TimedOut,
    /// The signal was dropped without firing: its owner went away first.
    Closed,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready(_))
    }
}

/// Write side, owned by the server task.
#[derive(Debug)]
pub struct ReadinessSignal {
    tx: Option<oneshot::Sender<String>>,
}

impl ReadinessSignal {
    /// Release the waiter. Only the first call has any effect.
    pub fn fire(&mut self, details: impl Into<String>) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The waiter may already have given up; firing is still final.
                let _ = tx.send(details.into());
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.tx.is_none()
    }
}

/// Read side, owned by the coordinator.
#[derive(Debug)]
pub struct ReadinessWaiter {
    rx: Option<oneshot::Receiver<String>>,
    observed: Option<Readiness>,
}

impl ReadinessWaiter {
    /// Block for at most `timeout`. A timed-out wait can be retried; `Ready`
    /// and `Closed` are sticky.
    pub async fn wait(&mut self, timeout: Duration) -> Readiness {
        if let Some(observed) = &self.observed {
            return observed.clone();
        }
        let Some(rx) = self.rx.as_mut() else {
            return Readiness::Closed;
        };
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(details)) => Readiness::Ready(details),
            Ok(Err(_)) => Readiness::Closed,
            Err(_) => {
                debug!("readiness wait timed out after {:?}", timeout);
                return Readiness::TimedOut;
            }
        };
        self.rx = None;
        self.observed = Some(outcome.clone());
        outcome
    }

    /// True only if the manifest was announced within `timeout`.
    pub async fn wait_for_mpd(&mut self, timeout: Duration) -> bool {
        let ready = self.wait(timeout).await.is_ready();
        if ready {
            info!("manifest seen, continuing");
        }
        ready
    }
}

/// Line matcher the server role runs over its output.
#[derive(Debug)]
pub struct ReadinessScanner {
    tokens: Vec<String>,
    signal: ReadinessSignal,
}

impl ReadinessScanner {
    pub fn new(tokens: Vec<String>, signal: ReadinessSignal) -> Self {
        Self { tokens, signal }
    }

    /// Feed one output line. Returns true on the line that fires the gate.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.signal.has_fired() || self.tokens.is_empty() {
            return false;
        }
        if self.tokens.iter().all(|token| line.contains(token.as_str())) {
            info!("manifest announced in server output: {line}");
            return self.signal.fire(line);
        }
        false
    }
}
