//! Role runners: the relay server, the sender and the receiver.
//!
//! Every role runs concurrently in its own tokio task. External roles wrap a
//! child process and consume its exit code and textual output; in-process
//! roles drive the [`transport`] seam directly.

use async_trait::async_trait;
use latprobe_types::{
    events::Role,
    records::{ReceiverRecord, SenderRecord},
    LatprobeError, Result,
};

pub mod external;
pub mod process;
pub mod readiness;
pub mod receiver;
pub mod server;
pub mod synthetic;
pub mod transport;

mod task;

pub use external::{ExternalReceiver, ExternalRole, ExternalSender};
pub use process::CommandSpec;
pub use readiness::{readiness_gate, Readiness, ReadinessScanner, ReadinessSignal, ReadinessWaiter};
pub use receiver::StreamReceiver;
pub use server::ServerRole;
pub use synthetic::{SyntheticSender, SyntheticSettings};

/// Exit status reported for a role whose task panicked or was aborted.
pub const TASK_FAILURE_STATUS: i32 = -1;

/// Signal number the coordinator uses to stop external roles.
const SIGTERM: i32 = 15;

/// Lifecycle shared by every role.
#[async_trait]
pub trait RoleRunner: Send {
    fn role(&self) -> Role;

    /// Launch the role. Returns as soon as the work is running.
    async fn start(&mut self) -> Result<()>;

    /// Request cooperative termination. A no-op for roles that have finished.
    async fn stop(&mut self) -> Result<()>;

    /// Wait for the role to finish and return its normalized exit status.
    async fn join(&mut self) -> Result<i32>;

    /// Exit status once the role has been joined.
    fn exit_status(&self) -> Option<i32>;

    fn is_finished(&self) -> bool;
}

/// Roles that append to a record log while they run.
pub trait RecordSource<R> {
    /// Move the collected records out. Only meaningful after `join`.
    fn take_records(&mut self) -> Vec<R>;
}

pub trait SenderRunner: RoleRunner + RecordSource<SenderRecord> {}

impl<T: RoleRunner + RecordSource<SenderRecord> + ?Sized> SenderRunner for T {}

pub trait ReceiverRunner: RoleRunner + RecordSource<ReceiverRecord> {}

impl<T: RoleRunner + RecordSource<ReceiverRecord> + ?Sized> ReceiverRunner for T {}

#[async_trait]
impl<T: RoleRunner + ?Sized> RoleRunner for Box<T> {
    fn role(&self) -> Role {
        (**self).role()
    }

    async fn start(&mut self) -> Result<()> {
        (**self).start().await
    }

    async fn stop(&mut self) -> Result<()> {
        (**self).stop().await
    }

    async fn join(&mut self) -> Result<i32> {
        (**self).join().await
    }

    fn exit_status(&self) -> Option<i32> {
        (**self).exit_status()
    }

    fn is_finished(&self) -> bool {
        (**self).is_finished()
    }
}

impl<R, T: RecordSource<R> + ?Sized> RecordSource<R> for Box<T> {
    fn take_records(&mut self) -> Vec<R> {
        (**self).take_records()
    }
}

/// Map a process outcome onto the integer status the coordinator judges.
///
/// A plain exit code is kept. Death by signal `n` becomes `-n`, except
/// SIGTERM, which is how roles are asked to stop and therefore counts as 0.
pub fn normalize_exit_status(code: Option<i32>, signal: Option<i32>) -> i32 {
    match (code, signal) {
        (Some(code), _) => code,
        (None, Some(SIGTERM)) => 0,
        (None, Some(signal)) => -signal,
        (None, None) => TASK_FAILURE_STATUS,
    }
}

/// Generate an error aligned with role semantics.
pub fn role_error(message: impl Into<String>) -> LatprobeError {
    LatprobeError::Role(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigterm_counts_as_clean_exit() {
        assert_eq!(normalize_exit_status(None, Some(15)), 0);
        assert_eq!(normalize_exit_status(None, Some(9)), -9);
        assert_eq!(normalize_exit_status(Some(0), None), 0);
        assert_eq!(normalize_exit_status(Some(3), None), 3);
        assert_eq!(normalize_exit_status(None, None), TASK_FAILURE_STATUS);
    }
}
