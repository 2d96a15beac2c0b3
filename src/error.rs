//! Error types for process executions.

use crate::output::CapturedOutput;
use std::ffi::OsString;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors ending an execution. None of them is retried.
///
/// Every variant for a process which was actually started carries the output captured until the
/// execution ended.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The OS could not create the process: missing binary, permission denied, invalid working
    /// directory.
    #[error("Failed to start process '{process_name}': {source}")]
    ProcessStartFailed {
        process_name: Arc<str>,
        program: OsString,
        #[source]
        source: io::Error,
    },

    /// The process ran to completion but exited with a non-success exit code.
    #[error("Process '{process_name}' exited with code {exit_code}: {}", .diagnostic.trim_end())]
    ExecutionFailed {
        process_name: Arc<str>,
        exit_code: i32,
        /// Captured stderr verbatim, or captured stdout when nothing at all was written to
        /// stderr.
        diagnostic: String,
        output: CapturedOutput,
        elapsed: Duration,
    },

    /// The process did not exit within its timeout and was terminated.
    #[error("Process '{process_name}' did not complete within {timeout:?}")]
    Timeout {
        process_name: Arc<str>,
        timeout: Duration,
        output: CapturedOutput,
    },

    /// The execution was cancelled by the caller and the process was terminated.
    #[error("Execution of process '{process_name}' was cancelled")]
    Cancelled {
        process_name: Arc<str>,
        output: CapturedOutput,
    },

    /// Waiting for the exit of the process failed. The process was killed.
    #[error("Failed to wait for process '{process_name}': {source}")]
    WaitFailed {
        process_name: Arc<str>,
        #[source]
        source: io::Error,
        output: CapturedOutput,
    },
}

impl ExecutionError {
    pub fn process_name(&self) -> &str {
        match self {
            ExecutionError::ProcessStartFailed { process_name, .. }
            | ExecutionError::ExecutionFailed { process_name, .. }
            | ExecutionError::Timeout { process_name, .. }
            | ExecutionError::Cancelled { process_name, .. }
            | ExecutionError::WaitFailed { process_name, .. } => process_name,
        }
    }

    /// The exit code, if the process ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionError::ExecutionFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// The output captured before the execution ended, if the process was started.
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            ExecutionError::ProcessStartFailed { .. } => None,
            ExecutionError::ExecutionFailed { output, .. }
            | ExecutionError::Timeout { output, .. }
            | ExecutionError::Cancelled { output, .. }
            | ExecutionError::WaitFailed { output, .. } => Some(output),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled { .. })
    }
}
