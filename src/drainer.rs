use crate::line_framer::{LineFramer, LineParsingOptions, NumBytes};
use crate::observer::{OutputObserver, StreamType};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum DrainerError {
    #[error("The {stream} drainer task could not be joined: {source}")]
    TaskJoin {
        stream: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Everything a drainer read from its stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    /// All lines, each followed by a `\n`.
    pub text: String,
    pub line_count: usize,
}

impl CapturedStream {
    fn push(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        self.line_count += 1;
    }
}

/// Continuously reads lines from one output stream of a process, hands each line to the
/// observer and records it.
///
/// Reading happens on its own tokio task, started by [StreamDrainer::spawn]. The task ends when
/// the stream is closed or when it is told to stop.
///
/// For proper cleanup, call [StreamDrainer::wait] or [StreamDrainer::finish]. If dropped before
/// that, the task is aborted and the captured output is lost.
pub struct StreamDrainer {
    stream: StreamType,
    task: Option<JoinHandle<CapturedStream>>,
    task_termination_sender: Option<oneshot::Sender<()>>,
}

impl StreamDrainer {
    pub fn spawn<R>(
        stream: StreamType,
        reader: R,
        observer: Option<Arc<dyn OutputObserver>>,
        chunk_size: NumBytes,
        options: LineParsingOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (term_sig_tx, term_sig_rx) = oneshot::channel::<()>();
        let framer = LineFramer::with_chunk_size(reader, chunk_size, options);
        Self {
            stream,
            task: Some(tokio::spawn(drain(stream, framer, observer, term_sig_rx))),
            task_termination_sender: Some(term_sig_tx),
        }
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    /// Checks if the drainer reached the end of its stream or was stopped.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Waits until the stream is closed.
    ///
    /// If the stream is never closed, for example because a grandchild of the process inherited
    /// it and keeps running, this waits forever. Prefer [StreamDrainer::finish].
    pub async fn wait(mut self) -> Result<CapturedStream, DrainerError> {
        let Some(task) = self.task.take() else {
            unreachable!("The drainer task is only taken once");
        };
        // Keep the sender alive until the task completed, so that the task does not observe
        // a closed termination channel.
        let result = task.await;
        drop(self.task_termination_sender.take());
        result.map_err(|source| DrainerError::TaskJoin {
            stream: self.stream.as_str(),
            source,
        })
    }

    /// Waits at most `timeout` for the stream to close, then tells the drainer to stop.
    ///
    /// A stopped drainer still records every line it already read, including a trailing partial
    /// line, before it ends.
    pub async fn finish(mut self, timeout: Duration) -> Result<CapturedStream, DrainerError> {
        let Some(mut task) = self.task.take() else {
            unreachable!("The drainer task is only taken once");
        };
        let stream = self.stream.as_str();

        let result = match tokio::time::timeout(timeout, &mut task).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::debug!(
                    stream,
                    ?timeout,
                    "Stream was not closed in time, stopping its drainer"
                );
                if let Some(sender) = self.task_termination_sender.take() {
                    // Sending fails if the task completed in the meantime, dropping the receiver.
                    let _res = sender.send(());
                }
                task.await
            }
        };
        result.map_err(|source| DrainerError::TaskJoin { stream, source })
    }
}

impl Drop for StreamDrainer {
    fn drop(&mut self) {
        if let Some(task_termination_sender) = self.task_termination_sender.take() {
            // Sending fails if the task already terminated, for example by reaching EOF.
            let _res = task_termination_sender.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(
    stream: StreamType,
    mut framer: LineFramer<R>,
    observer: Option<Arc<dyn OutputObserver>>,
    mut term_sig_rx: oneshot::Receiver<()>,
) -> CapturedStream {
    let mut captured = CapturedStream::default();
    let mut record = |line: String| {
        if let Some(observer) = &observer {
            observer.on_line(stream, &line);
        }
        captured.push(&line);
    };

    // The stop signal is checked before every line. A stream which never runs dry must not keep
    // the drainer alive.
    loop {
        tokio::select! {
            biased;
            _msg = &mut term_sig_rx => {
                // Told to stop. Whatever was read so far is kept.
                for line in framer.flush() {
                    record(line);
                }
                break;
            }
            maybe_line = framer.next_line() => match maybe_line {
                Some(line) => record(line),
                None => break,
            },
        }
    }

    tracing::trace!(
        stream = stream.as_str(),
        lines = captured.line_count,
        closed = framer.is_closed(),
        "Drainer finished"
    );
    captured
}
