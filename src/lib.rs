mod deadline;
mod drainer;
mod error;
mod line_framer;
mod observer;
mod output;
mod request;
mod runner;
mod signal;
mod termination;

pub use deadline::DeadlineGuard;
pub use drainer::{CapturedStream, DrainerError, StreamDrainer};
pub use error::ExecutionError;
pub use line_framer::{
    DEFAULT_MAX_LINE_LENGTH, DEFAULT_READ_CHUNK_SIZE, LineFramer, LineOverflowBehavior,
    LineParsingOptions, NumBytes, NumBytesExt,
};
pub use observer::{
    ChannelObserver, FnObserver, NoopObserver, OutputLine, OutputObserver, StreamType,
};
pub use output::{CapturedOutput, ExecutionOutcome, ExecutionResult, SUCCESS_EXIT_CODE};
pub use request::{AutoNameSettings, EnvPolicy, ExecutionRequest, ProcessName};
pub use runner::{DEFAULT_DRAIN_TIMEOUT, ProcessRunner, RunnerOptions, execute};
pub use termination::{TerminationError, TerminationPolicy};
pub use tokio_util::sync::CancellationToken;
