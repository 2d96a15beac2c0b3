use crate::error::ExecutionError;
use std::ffi::OsString;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

/// The exit code a process reports on success.
pub const SUCCESS_EXIT_CODE: i32 = 0;

/// Output captured from a process, possibly cut short by a timeout or cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Every line read from stdout, each followed by a `\n`.
    pub stdout: String,

    /// Every line read from stderr, each followed by a `\n`.
    pub stderr: String,
}

impl CapturedOutput {
    /// The text best describing a failure: stderr, or stdout when nothing was written to stderr.
    pub fn diagnostic(&self) -> &str {
        match self.stderr.is_empty() {
            true => &self.stdout,
            false => &self.stderr,
        }
    }
}

/// A process which ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Every line read from stdout, each followed by a `\n`.
    pub stdout: String,

    /// Every line read from stderr, each followed by a `\n`.
    pub stderr: String,

    /// The exit code of the process. A process terminated by a signal reports `128 + signal`.
    pub exit_code: i32,

    /// Wall-clock time from spawning the process until its output was fully read.
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == SUCCESS_EXIT_CODE
    }

    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }

    pub fn stderr_lines(&self) -> impl Iterator<Item = &str> {
        self.stderr.lines()
    }

    pub fn into_output(self) -> CapturedOutput {
        CapturedOutput {
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// How a single execution ended. Exactly one outcome is produced per execution.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The process exited before any deadline, with any exit code.
    Completed(ExecutionResult),

    /// The deadline expired first. The process was terminated.
    TimedOut {
        timeout: Duration,
        output: CapturedOutput,
    },

    /// The process could not be created. No output was read.
    FailedToStart { program: OsString, source: io::Error },

    /// The caller cancelled the execution. The process was terminated.
    Cancelled { output: CapturedOutput },

    /// The OS failed to report the exit status of the running process. The process was killed.
    WaitFailed {
        source: io::Error,
        output: CapturedOutput,
    },
}

impl ExecutionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed(_))
    }

    /// Maps this outcome to a result, treating any exit code but [SUCCESS_EXIT_CODE] as failure.
    ///
    /// A failed execution carries the captured stderr as its diagnostic, or the captured stdout
    /// when stderr is empty.
    pub fn into_result(
        self,
        process_name: impl Into<Arc<str>>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let process_name = process_name.into();
        match self {
            ExecutionOutcome::Completed(result) if result.success() => Ok(result),
            ExecutionOutcome::Completed(result) => {
                let exit_code = result.exit_code;
                let elapsed = result.elapsed;
                let output = result.into_output();
                Err(ExecutionError::ExecutionFailed {
                    process_name,
                    exit_code,
                    diagnostic: output.diagnostic().to_owned(),
                    output,
                    elapsed,
                })
            }
            ExecutionOutcome::TimedOut { timeout, output } => Err(ExecutionError::Timeout {
                process_name,
                timeout,
                output,
            }),
            ExecutionOutcome::FailedToStart { program, source } => {
                Err(ExecutionError::ProcessStartFailed {
                    process_name,
                    program,
                    source,
                })
            }
            ExecutionOutcome::Cancelled { output } => Err(ExecutionError::Cancelled {
                process_name,
                output,
            }),
            ExecutionOutcome::WaitFailed { source, output } => Err(ExecutionError::WaitFailed {
                process_name,
                source,
                output,
            }),
        }
    }
}

/// The exit code of a process, following the shell convention of `128 + signal` for processes
/// terminated by a signal.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertr::prelude::*;

    fn completed(exit_code: i32, stdout: &str, stderr: &str) -> ExecutionOutcome {
        ExecutionOutcome::Completed(ExecutionResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            elapsed: Duration::from_millis(5),
        })
    }

    #[test]
    fn only_the_success_code_maps_to_a_result() {
        for exit_code in [-1, 0, 1, 2, 3, 12, 130, 137, 255] {
            let result = completed(exit_code, "out\n", "err\n").into_result("restic");
            match result {
                Ok(result) => {
                    assert_that(exit_code).is_equal_to(SUCCESS_EXIT_CODE);
                    assert_that(result.success()).is_true();
                }
                Err(ExecutionError::ExecutionFailed { exit_code: code, .. }) => {
                    assert_that(code).is_equal_to(exit_code);
                    assert_that(exit_code).is_not_equal_to(SUCCESS_EXIT_CODE);
                }
                Err(err) => panic!("Unexpected error: {err}"),
            }
        }
    }

    #[test]
    fn failure_diagnostic_is_stderr() {
        let err = completed(1, "progress\n", "Fatal: repository does not exist\n")
            .into_result("restic")
            .unwrap_err();
        let ExecutionError::ExecutionFailed {
            diagnostic, output, ..
        } = err
        else {
            panic!("Expected ExecutionFailed");
        };
        assert_that(diagnostic).is_equal_to("Fatal: repository does not exist\n");
        assert_that(output.stdout).is_equal_to("progress\n");
    }

    #[test]
    fn failure_diagnostic_falls_back_to_stdout() {
        let err = completed(3, "some files could not be read\n", "")
            .into_result("restic")
            .unwrap_err();
        assert_that(err.to_string())
            .is_equal_to("Process 'restic' exited with code 3: some files could not be read");
    }

    #[test]
    fn whitespace_on_stderr_is_kept_as_diagnostic() {
        let err = completed(2, "out\n", "  \n").into_result("restic").unwrap_err();
        let ExecutionError::ExecutionFailed { diagnostic, .. } = err else {
            panic!("Expected ExecutionFailed");
        };
        assert_that(diagnostic).is_equal_to("  \n");
    }

    #[test]
    fn failure_without_any_output_has_an_empty_diagnostic() {
        let err = completed(1, "", "").into_result("false").unwrap_err();
        let ExecutionError::ExecutionFailed {
            exit_code,
            diagnostic,
            ..
        } = err
        else {
            panic!("Expected ExecutionFailed");
        };
        assert_that(exit_code).is_equal_to(1);
        assert_that(diagnostic).is_equal_to("");
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let err = ExecutionOutcome::TimedOut {
            timeout: Duration::from_millis(100),
            output: CapturedOutput {
                stdout: "a\nb\n".to_string(),
                stderr: String::new(),
            },
        }
        .into_result("restic")
        .unwrap_err();

        assert_that(err.is_timeout()).is_true();
        assert_that(err.exit_code()).is_none();
        assert_that(err.output().map(|o| o.stdout.as_str())).is_equal_to(Some("a\nb\n"));
        assert_that(err.to_string()).is_equal_to("Process 'restic' did not complete within 100ms");
    }

    #[test]
    fn result_lines() {
        let ExecutionOutcome::Completed(result) = completed(0, "a\nb\n", "c\n") else {
            unreachable!()
        };
        assert_that(result.stdout_lines().collect::<Vec<_>>()).is_equal_to(vec!["a", "b"]);
        assert_that(result.stderr_lines().collect::<Vec<_>>()).is_equal_to(vec!["c"]);
    }

    #[cfg(unix)]
    #[test]
    fn signal_terminations_map_to_shell_exit_codes() {
        use std::os::unix::process::ExitStatusExt;

        assert_that(exit_code(ExitStatus::from_raw(0))).is_equal_to(0);
        assert_that(exit_code(ExitStatus::from_raw(2 << 8))).is_equal_to(2);
        assert_that(exit_code(ExitStatus::from_raw(9))).is_equal_to(137);
        assert_that(exit_code(ExitStatus::from_raw(15))).is_equal_to(143);
    }
}
