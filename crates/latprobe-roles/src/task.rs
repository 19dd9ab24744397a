use std::future::Future;

use latprobe_types::{events::Role, Result};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

use crate::{role_error, TASK_FAILURE_STATUS};

/// What a role task hands back when it finishes.
pub(crate) struct TaskOutcome<R> {
    pub exit_status: i32,
    pub records: Vec<R>,
}

impl<R> TaskOutcome<R> {
    pub fn new(exit_status: i32, records: Vec<R>) -> Self {
        Self {
            exit_status,
            records,
        }
    }
}

/// Bookkeeping shared by all role runners: the spawned task, its shutdown
/// flag and the status and records it returned.
pub(crate) struct RoleTask<R> {
    role: Role,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<TaskOutcome<R>>>,
    exit_status: Option<i32>,
    records: Vec<R>,
}

impl<R: Send + 'static> RoleTask<R> {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            shutdown: None,
            handle: None,
            exit_status: None,
            records: Vec::new(),
        }
    }

    pub fn ensure_not_started(&self) -> Result<()> {
        if self.handle.is_some() || self.exit_status.is_some() {
            Err(role_error(format!("{} already started", self.role)))
        } else {
            Ok(())
        }
    }

    pub fn spawn<F, Fut>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = TaskOutcome<R>> + Send + 'static,
    {
        self.ensure_not_started()?;
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);
        self.handle = Some(tokio::spawn(body(rx)));
        info!(role = %self.role, "role started");
        Ok(())
    }

    /// Flip the shutdown flag. Returns false when there is nothing to stop.
    pub fn request_stop(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        match &self.shutdown {
            Some(tx) => {
                info!(role = %self.role, "stop requested");
                tx.send(true).is_ok()
            }
            None => false,
        }
    }

    pub async fn join(&mut self) -> Result<i32> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        // Await in place: a cancelled join leaves the handle for the next call.
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| role_error(format!("{} was never started", self.role)))?;
        let joined = handle.await;
        self.handle = None;
        let status = match joined {
            Ok(outcome) => {
                self.records = outcome.records;
                outcome.exit_status
            }
            Err(err) => {
                error!(role = %self.role, "role task failed: {err}");
                TASK_FAILURE_STATUS
            }
        };
        self.exit_status = Some(status);
        self.shutdown = None;
        info!(role = %self.role, exit_status = status, "role finished");
        Ok(status)
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn is_finished(&self) -> bool {
        self.exit_status.is_some()
            || self
                .handle
                .as_ref()
                .map(|handle| handle.is_finished())
                .unwrap_or(false)
    }

    pub fn take_records(&mut self) -> Vec<R> {
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancelled_join_can_be_retried() {
        let mut task: RoleTask<u32> = RoleTask::new(Role::Sender);
        task.spawn(|mut shutdown| async move {
            let _ = shutdown.changed().await;
            TaskOutcome::new(0, vec![1, 2, 3])
        })
        .expect("spawn");

        let first = tokio::time::timeout(Duration::from_millis(50), task.join()).await;
        assert!(first.is_err(), "task must still be running");
        assert!(!task.is_finished());

        assert!(task.request_stop());
        assert_eq!(task.join().await.expect("second join"), 0);
        assert_eq!(task.exit_status(), Some(0));
        assert_eq!(task.take_records(), vec![1, 2, 3]);
        assert_eq!(task.join().await.expect("joined again"), 0);
    }

    #[tokio::test]
    async fn join_before_spawn_is_an_error() {
        let mut task: RoleTask<u32> = RoleTask::new(Role::Receiver);
        assert!(task.join().await.is_err());
        assert!(!task.request_stop());
    }

    #[tokio::test]
    async fn panicked_task_reports_failure_status() {
        let mut task: RoleTask<u32> = RoleTask::new(Role::Server);
        let fail = true;
        task.spawn(move |_| async move {
            if fail {
                panic!("role body failed");
            }
            TaskOutcome::new(0, Vec::new())
        })
        .expect("spawn");
        assert_eq!(task.join().await.expect("join"), TASK_FAILURE_STATUS);
        assert!(task.spawn(|_| async { TaskOutcome::new(0, Vec::new()) }).is_err());
    }
}
