use crate::deadline::{self, DeadlineGuard};
use crate::drainer::{CapturedStream, StreamDrainer};
use crate::error::ExecutionError;
use crate::line_framer::{DEFAULT_READ_CHUNK_SIZE, LineParsingOptions, NumBytes};
use crate::observer::{OutputObserver, StreamType};
use crate::output::{self, CapturedOutput, ExecutionOutcome, ExecutionResult};
use crate::request::ExecutionRequest;
use crate::termination::{self, KillOnDrop, TerminationPolicy};
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default upper bound on how long output is still read after the process ended.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Options shared by all executions of a [ProcessRunner].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerOptions {
    pub line_parsing: LineParsingOptions,

    /// Size of the buffer each output stream is read into.
    ///
    /// default: 16 kilobytes
    pub read_chunk_size: NumBytes,

    /// How processes are terminated on timeout or cancellation.
    pub termination: TerminationPolicy,

    /// How long output is still read once the process exited or was terminated.
    ///
    /// Only matters when something else keeps the output pipes open, usually a background
    /// process started by the child. Reading stops after this timeout, keeping all output read
    /// until then.
    ///
    /// default: 5 seconds
    pub drain_timeout: Duration,

    /// Start each process as the leader of a new process group, so that termination also
    /// reaches the processes it started. Only has an effect on unix.
    ///
    /// default: true
    pub new_process_group: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            line_parsing: LineParsingOptions::default(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            termination: TerminationPolicy::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            new_process_group: true,
        }
    }
}

impl RunnerOptions {
    pub fn line_parsing(mut self, line_parsing: LineParsingOptions) -> Self {
        self.line_parsing = line_parsing;
        self
    }

    pub fn read_chunk_size(mut self, read_chunk_size: NumBytes) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    pub fn termination(mut self, termination: TerminationPolicy) -> Self {
        self.termination = termination;
        self
    }

    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn new_process_group(mut self, new_process_group: bool) -> Self {
        self.new_process_group = new_process_group;
        self
    }
}

/// The first thing that happened to a running process.
#[derive(Debug)]
enum TerminalEvent {
    Exited(io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

/// Executes external processes, capturing their output line by line.
///
/// A runner holds no state besides its options. It can be shared freely and used for any number
/// of concurrent executions.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    options: RunnerOptions,
}

impl ProcessRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Executes the requested process until it exits, its timeout expires or its execution is
    /// cancelled.
    ///
    /// Only an exit code of zero counts as success. Every error for a process which was started
    /// carries the output captured until then.
    ///
    /// Dropping the returned future kills the process.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutionError> {
        let process_name: Arc<str> = Arc::from(request.display_name());
        self.run_named(request, &process_name)
            .await
            .into_result(process_name)
    }

    /// Like [ProcessRunner::execute], but returns how the execution ended without judging the
    /// exit code.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let process_name: Arc<str> = Arc::from(request.display_name());
        self.run_named(request, &process_name).await
    }

    async fn run_named(
        &self,
        request: ExecutionRequest,
        process_name: &Arc<str>,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let process_group = self.options.new_process_group;

        let mut child = match request.to_command(process_group).spawn() {
            Ok(child) => child,
            Err(source) => {
                tracing::warn!(process = %process_name, error = %source, "Failed to start process");
                return ExecutionOutcome::FailedToStart {
                    program: request.program.clone(),
                    source,
                };
            }
        };
        let mut kill_on_drop = KillOnDrop::arm(process_name, &child, process_group);
        tracing::debug!(process = %process_name, pid = ?child.id(), "Process started");

        let stdout = self.spawn_drainer(StreamType::StdOut, child.stdout.take(), &request.observer);
        let stderr = self.spawn_drainer(StreamType::StdErr, child.stderr.take(), &request.observer);

        let mut deadline = DeadlineGuard::start_optional(request.timeout);
        let cancellation = request.cancellation.clone().unwrap_or_default();

        // The first event wins. Process exit is polled first, so a process exiting at the same
        // time its deadline expires counts as completed.
        let event = tokio::select! {
            biased;
            status = child.wait() => TerminalEvent::Exited(status),
            timeout = deadline::expired(deadline.as_mut()) => TerminalEvent::TimedOut(timeout),
            () = cancellation.cancelled() => TerminalEvent::Cancelled,
        };
        drop(deadline);

        match &event {
            TerminalEvent::Exited(Ok(_status)) => {}
            TerminalEvent::Exited(Err(err)) => {
                tracing::warn!(process = %process_name, error = %err, "Failed to wait for process, killing it");
                self.terminate(&mut child, process_name, TerminationPolicy::immediate())
                    .await;
            }
            TerminalEvent::TimedOut(timeout) => {
                tracing::warn!(process = %process_name, ?timeout, "Process timed out, terminating it");
                self.terminate(&mut child, process_name, self.options.termination)
                    .await;
            }
            TerminalEvent::Cancelled => {
                tracing::warn!(process = %process_name, "Execution was cancelled, terminating process");
                self.terminate(&mut child, process_name, self.options.termination)
                    .await;
            }
        }

        let (stdout, stderr) = tokio::join!(
            self.finish_drainer(stdout, process_name),
            self.finish_drainer(stderr, process_name),
        );
        kill_on_drop.defuse();

        let elapsed = started.elapsed();
        tracing::trace!(
            process = %process_name,
            stdout = %stdout.text,
            stderr = %stderr.text,
            "Captured output"
        );
        let output = CapturedOutput {
            stdout: stdout.text,
            stderr: stderr.text,
        };

        match event {
            TerminalEvent::Exited(Ok(status)) => {
                let exit_code = output::exit_code(status);
                tracing::info!(process = %process_name, exit_code, ?elapsed, "Process exited");
                ExecutionOutcome::Completed(ExecutionResult {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code,
                    elapsed,
                })
            }
            TerminalEvent::Exited(Err(source)) => ExecutionOutcome::WaitFailed { source, output },
            TerminalEvent::TimedOut(timeout) => ExecutionOutcome::TimedOut { timeout, output },
            TerminalEvent::Cancelled => ExecutionOutcome::Cancelled { output },
        }
    }

    fn spawn_drainer<R>(
        &self,
        stream: StreamType,
        reader: Option<R>,
        observer: &Option<Arc<dyn OutputObserver>>,
    ) -> StreamDrainer
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let observer = observer.clone();
        let chunk_size = self.options.read_chunk_size;
        let options = self.options.line_parsing;
        match reader {
            Some(reader) => StreamDrainer::spawn(stream, reader, observer, chunk_size, options),
            // Streams are always piped. Should one be missing, it reads as empty.
            None => StreamDrainer::spawn(stream, tokio::io::empty(), observer, chunk_size, options),
        }
    }

    async fn finish_drainer(
        &self,
        drainer: StreamDrainer,
        process_name: &Arc<str>,
    ) -> CapturedStream {
        match drainer.finish(self.options.drain_timeout).await {
            Ok(captured) => captured,
            Err(err) => {
                tracing::warn!(
                    process = %process_name,
                    error = %err,
                    "Output of process could not be captured"
                );
                CapturedStream::default()
            }
        }
    }

    async fn terminate(&self, child: &mut Child, process_name: &Arc<str>, policy: TerminationPolicy) {
        if let Err(err) = termination::terminate(
            child,
            process_name,
            self.options.new_process_group,
            policy,
        )
        .await
        {
            tracing::error!(
                process = %process_name,
                error = %err,
                "Failed to terminate process"
            );
        }
    }
}

/// Executes `request` using a [ProcessRunner] with default options.
pub async fn execute(request: ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
    ProcessRunner::default().execute(request).await
}
