use crate::signal;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;

/// Errors that can occur when forcefully terminating a process.
#[derive(Debug, Error)]
pub enum TerminationError {
    /// Failed to send a signal to the process.
    #[error("Failed to send '{signal}' signal to process '{process_name}': {source}")]
    SignallingFailed {
        process_name: Arc<str>,
        signal: &'static str,
        #[source]
        source: io::Error,
    },

    /// The process was signalled, but waiting for it to exit failed.
    #[error("Failed to wait for termination of process '{process_name}': {source}")]
    WaitFailed {
        process_name: Arc<str>,
        #[source]
        source: io::Error,
    },
}

/// How a process is terminated once its deadline expired or its execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// When set, the process is first asked to terminate (`SIGTERM` on unix) and only killed when
    /// it is still alive after this period. Backup tools use this chance to release repository
    /// locks. When `None`, the process is killed immediately.
    ///
    /// default: 2 seconds
    pub grace_period: Option<Duration>,
}

impl TerminationPolicy {
    pub fn graceful(grace_period: Duration) -> Self {
        Self {
            grace_period: Some(grace_period),
        }
    }

    pub fn immediate() -> Self {
        Self { grace_period: None }
    }
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self::graceful(Duration::from_secs(2))
    }
}

/// Terminates `child` according to `policy` and waits until it is reaped.
///
/// With `process_group`, signals go to the whole group led by `child`, and group members still
/// alive after the leader exited are killed as well.
pub(crate) async fn terminate(
    child: &mut Child,
    process_name: &Arc<str>,
    process_group: bool,
    policy: TerminationPolicy,
) -> Result<ExitStatus, TerminationError> {
    let pid = child.id();

    let status = match graceful_termination(child, process_name, process_group, policy).await? {
        Some(status) => status,
        None => {
            signal::send_kill(child, process_group).map_err(|source| {
                TerminationError::SignallingFailed {
                    process_name: Arc::clone(process_name),
                    signal: "SIGKILL",
                    source,
                }
            })?;
            child
                .wait()
                .await
                .map_err(|source| TerminationError::WaitFailed {
                    process_name: Arc::clone(process_name),
                    source,
                })?
        }
    };

    if let (true, Some(pid)) = (process_group, pid) {
        if let Err(err) = signal::kill_process_group(pid) {
            tracing::warn!(
                process = %process_name,
                error = %err,
                "Could not kill remaining members of the process group"
            );
        }
    }

    Ok(status)
}

/// Returns `None` when the process must be killed.
async fn graceful_termination(
    child: &mut Child,
    process_name: &Arc<str>,
    process_group: bool,
    policy: TerminationPolicy,
) -> Result<Option<ExitStatus>, TerminationError> {
    let Some(grace_period) = policy.grace_period else {
        return Ok(None);
    };

    if let Err(err) = signal::send_terminate(child, process_group) {
        tracing::warn!(
            process = %process_name,
            error = %err,
            "Could not ask process to terminate, killing it"
        );
        return Ok(None);
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(exit_status)) => Ok(Some(exit_status)),
        Ok(Err(source)) => Err(TerminationError::WaitFailed {
            process_name: Arc::clone(process_name),
            source,
        }),
        Err(_elapsed) => {
            tracing::warn!(
                process = %process_name,
                ?grace_period,
                "Process did not terminate within its grace period, killing it"
            );
            Ok(None)
        }
    }
}

/// Kills a process group when dropped while still armed.
///
/// Guards an execution which is abandoned before reaching a terminal state, for example because
/// the future driving it was dropped. The direct child is additionally covered by
/// `kill_on_drop`, which does not reach the other members of its process group.
#[derive(Debug)]
pub(crate) struct KillOnDrop {
    process_name: Arc<str>,
    process_group_id: Option<u32>,
    armed: bool,
}

impl KillOnDrop {
    pub(crate) fn arm(process_name: &Arc<str>, child: &Child, process_group: bool) -> Self {
        Self {
            process_name: Arc::clone(process_name),
            process_group_id: child.id().filter(|_| process_group),
            armed: true,
        }
    }

    /// Calling this prevents the kill when this type is dropped.
    pub(crate) fn defuse(&mut self) {
        self.armed = false;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if !self.is_armed() {
            return;
        }
        tracing::debug!(
            process = %self.process_name,
            "Execution was abandoned while the process was running, killing it"
        );
        if let Some(pgid) = self.process_group_id {
            if let Err(err) = signal::kill_process_group(pgid) {
                tracing::error!(
                    process = %self.process_name,
                    error = %err,
                    "Failed to kill abandoned process group"
                );
            }
        }
    }
}
