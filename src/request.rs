//! Description of a single process invocation.

use crate::observer::OutputObserver;
use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the environment of the child process is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvPolicy {
    /// The child inherits the environment of the current process. Variables set on the request
    /// are added, replacing inherited variables of the same name. `PATH` and `HOME` stay
    /// available to the child.
    #[default]
    Inherit,

    /// The child only sees the variables set on the request.
    Clear,
}

/// Controls which parts of a request are captured in an automatically generated process name.
///
/// Environment variable values are never captured, only their names. Backup tools commonly receive
/// repository passwords through their environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoNameSettings {
    include_current_dir: bool,
    include_envs: bool,
    include_args: bool,
}

impl AutoNameSettings {
    /// Example: `restic --repo /srv/backup snapshots` is captured as `"restic"`.
    pub fn program_only() -> Self {
        AutoNameSettings {
            include_current_dir: false,
            include_envs: false,
            include_args: false,
        }
    }

    /// Example: `restic --repo /srv/backup snapshots` is captured as
    /// `"restic \"--repo\" \"/srv/backup\" \"snapshots\""`.
    pub fn program_with_args() -> Self {
        AutoNameSettings {
            include_current_dir: false,
            include_envs: false,
            include_args: true,
        }
    }

    /// Example: `RESTIC_PASSWORD=secret restic check` is captured as
    /// `"RESTIC_PASSWORD=*** restic \"check\""`.
    pub fn program_with_env_and_args() -> Self {
        AutoNameSettings {
            include_current_dir: false,
            include_envs: true,
            include_args: true,
        }
    }

    /// Like [AutoNameSettings::program_with_env_and_args], prefixed with the working directory,
    /// as in `"/srv % RESTIC_PASSWORD=*** restic \"check\""`.
    pub fn full() -> Self {
        AutoNameSettings {
            include_current_dir: true,
            include_envs: true,
            include_args: true,
        }
    }

    fn format_request(&self, request: &ExecutionRequest) -> String {
        let mut name = String::new();
        if self.include_current_dir {
            if let Some(current_dir) = &request.current_dir {
                name.push_str(current_dir.to_string_lossy().as_ref());
                name.push_str(" % ");
            }
        }
        if self.include_envs {
            for (key, _value) in &request.envs {
                name.push_str(key.to_string_lossy().as_ref());
                name.push_str("=*** ");
            }
        }
        name.push_str(request.program.to_string_lossy().as_ref());
        name.push(' ');
        if self.include_args {
            for arg in &request.args {
                name.push('"');
                name.push_str(arg.to_string_lossy().as_ref());
                name.push('"');
                name.push(' ');
            }
        }
        if name.ends_with(' ') {
            name.pop();
        }
        name
    }
}

impl Default for AutoNameSettings {
    fn default() -> Self {
        Self::program_with_args()
    }
}

/// Specifies how a process is named in logs and errors.
#[derive(Debug, Clone)]
pub enum ProcessName {
    /// Use an explicit custom name.
    ///
    /// Example: `ProcessName::Explicit("restic backup".into())`
    Explicit(Cow<'static, str>),

    /// Generate the name from the request.
    Auto(AutoNameSettings),
}

impl Default for ProcessName {
    fn default() -> Self {
        Self::Auto(AutoNameSettings::default())
    }
}

impl From<&'static str> for ProcessName {
    fn from(s: &'static str) -> Self {
        Self::Explicit(Cow::Borrowed(s))
    }
}

impl From<String> for ProcessName {
    fn from(s: String) -> Self {
        Self::Explicit(Cow::Owned(s))
    }
}

impl From<AutoNameSettings> for ProcessName {
    fn from(settings: AutoNameSettings) -> Self {
        Self::Auto(settings)
    }
}

/// Everything needed to run one process: what to run, where, with which environment, for how
/// long, and who observes its output.
///
/// Built by the caller and consumed by [crate::ProcessRunner::execute].
///
/// # Examples
///
/// ```no_run
/// use backup_runner::{ExecutionRequest, ProcessRunner};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), backup_runner::ExecutionError> {
/// let request = ExecutionRequest::new("restic")
///     .args(["--repo", "/srv/backup", "snapshots", "--json"])
///     .env("RESTIC_PASSWORD_FILE", "/etc/restic/password")
///     .timeout(Duration::from_secs(60));
///
/// let result = ProcessRunner::default().execute(request).await?;
/// println!("{}", result.stdout);
/// # Ok(())
/// # }
/// ```
pub struct ExecutionRequest {
    pub(crate) program: OsString,
    pub(crate) args: Vec<OsString>,
    pub(crate) envs: Vec<(OsString, OsString)>,
    pub(crate) env_policy: EnvPolicy,
    pub(crate) current_dir: Option<PathBuf>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) observer: Option<Arc<dyn OutputObserver>>,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) name: ProcessName,
}

impl ExecutionRequest {
    /// Creates a request running `program`, which is either a path or a name looked up in `PATH`.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            envs: Vec::new(),
            env_policy: EnvPolicy::default(),
            current_dir: None,
            timeout: None,
            observer: None,
            cancellation: None,
            name: ProcessName::default(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// Sets an environment variable for the child process only. Setting the same key twice keeps
    /// the last value.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        let key = key.as_ref().to_owned();
        self.envs.retain(|(existing, _)| *existing != key);
        self.envs.push((key, value.as_ref().to_owned()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value);
        }
        self
    }

    /// Default: [EnvPolicy::Inherit]
    pub fn env_policy(mut self, env_policy: EnvPolicy) -> Self {
        self.env_policy = env_policy;
        self
    }

    /// Sets the working directory of the child process. The current process keeps its own.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Limits the wall-clock runtime of the process. Without a timeout, the process may run
    /// forever.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn OutputObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Allows the caller to cancel the execution. Cancelling the token terminates the process.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn name(mut self, name: impl Into<ProcessName>) -> Self {
        self.name = name.into();
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(OsString::as_os_str)
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The name used for this process in logs and errors.
    pub fn display_name(&self) -> Cow<'static, str> {
        match &self.name {
            ProcessName::Explicit(name) => name.clone(),
            ProcessName::Auto(settings) => settings.format_request(self).into(),
        }
    }

    /// Builds the command. Output streams are piped, stdin is closed.
    pub(crate) fn to_command(&self, process_group: bool) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        if self.env_policy == EnvPolicy::Clear {
            cmd.env_clear();
        }
        cmd.envs(self.envs.iter().map(|(key, value)| (key, value)));
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            if process_group {
                cmd.process_group(0);
            }
        }
        #[cfg(not(unix))]
        let _ = process_group;

        cmd
    }
}

impl Debug for ExecutionRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("program", &self.program)
            .field("args", &self.args)
            .field(
                "envs",
                &self.envs.iter().map(|(key, _)| key).collect::<Vec<_>>(),
            )
            .field("env_policy", &self.env_policy)
            .field("current_dir", &self.current_dir)
            .field("timeout", &self.timeout)
            .field("observer", &self.observer.as_ref().map(|_| "dyn OutputObserver"))
            .field("cancellation", &self.cancellation)
            .field("name", &self.name)
            .finish()
    }
}
