//! Receives the output of a running process, line by line.

use std::fmt::{Debug, Formatter};
use tokio::sync::mpsc::UnboundedSender;

/// Represents the stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    StdOut,
    StdErr,
}

impl StreamType {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::StdOut => "stdout",
            StreamType::StdErr => "stderr",
        }
    }
}

/// Observes the output of a process while it runs.
///
/// Each method is called once per line, in the order the lines were read from that stream. Lines
/// of stdout and stderr are read concurrently, so no ordering exists between the two streams and
/// both methods may be called at the same time from different tasks.
///
/// A slow observer slows down reading of the stream it observes. Once the OS pipe buffer is full,
/// the process blocks on its next write to that stream.
#[cfg_attr(test, mockall::automock)]
pub trait OutputObserver: Send + Sync {
    fn on_stdout_line(&self, line: &str);

    fn on_stderr_line(&self, line: &str);
}

impl dyn OutputObserver {
    pub(crate) fn on_line(&self, stream: StreamType, line: &str) {
        match stream {
            StreamType::StdOut => self.on_stdout_line(line),
            StreamType::StdErr => self.on_stderr_line(line),
        }
    }
}

/// Ignores all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl OutputObserver for NoopObserver {
    fn on_stdout_line(&self, _line: &str) {}

    fn on_stderr_line(&self, _line: &str) {}
}

/// Forwards lines to two closures, one per stream.
pub struct FnObserver<O, E> {
    on_stdout: O,
    on_stderr: E,
}

impl<O, E> FnObserver<O, E>
where
    O: Fn(&str) + Send + Sync,
    E: Fn(&str) + Send + Sync,
{
    pub fn new(on_stdout: O, on_stderr: E) -> Self {
        Self {
            on_stdout,
            on_stderr,
        }
    }
}

impl<O, E> Debug for FnObserver<O, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnObserver").finish_non_exhaustive()
    }
}

impl<O, E> OutputObserver for FnObserver<O, E>
where
    O: Fn(&str) + Send + Sync,
    E: Fn(&str) + Send + Sync,
{
    fn on_stdout_line(&self, line: &str) {
        (self.on_stdout)(line)
    }

    fn on_stderr_line(&self, line: &str) {
        (self.on_stderr)(line)
    }
}

/// A single line of output, tagged with the stream it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamType,
    pub text: String,
}

/// Sends every line into an unbounded channel, for consumers living on another task.
///
/// Sending never blocks, so this observer does not apply backpressure to the process. Lines are
/// silently dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: UnboundedSender<OutputLine>,
}

impl ChannelObserver {
    pub fn new(sender: UnboundedSender<OutputLine>) -> Self {
        Self { sender }
    }

    fn send(&self, stream: StreamType, line: &str) {
        // The receiver may already be dropped. Nobody is interested in this line then.
        let _ = self.sender.send(OutputLine {
            stream,
            text: line.to_owned(),
        });
    }
}

impl OutputObserver for ChannelObserver {
    fn on_stdout_line(&self, line: &str) {
        self.send(StreamType::StdOut, line);
    }

    fn on_stderr_line(&self, line: &str) {
        self.send(StreamType::StdErr, line);
    }
}
