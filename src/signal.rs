//! Delivery of termination signals to a child process, or to the process group it leads.
//!
//! Signals sent to a process which no longer exists are not considered an error.

use std::io;
use tokio::process::Child;

/// Ask the `child` to terminate gracefully.
/// This signal is typically sent to a process when the operating system requests a termination.
///
/// - on `cfg(unix)`: Sends a `SIGTERM` to the process, or to its whole process group.
/// - on any other platform: Kills the process, as there is no graceful equivalent.
pub(crate) fn send_terminate(child: &mut Child, process_group: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            // Returns `None` if child was already "polled to completion".
            return Ok(());
        };
        unix::send(pid, process_group, nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    {
        let _ = process_group;
        send_kill(child, false)
    }
}

/// Kill the `child` without giving it a chance to clean up.
///
/// - on `cfg(unix)`: Sends a `SIGKILL` to the process, or to its whole process group.
/// - on any other platform: Uses [Child::start_kill].
pub(crate) fn send_kill(child: &mut Child, process_group: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        if process_group {
            let Some(pid) = child.id() else {
                return Ok(());
            };
            return unix::send(pid, true, nix::sys::signal::Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    let _ = process_group;

    match child.start_kill() {
        Ok(()) => Ok(()),
        // Already exited and reaped.
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err),
    }
}

/// Kill whatever is left of the process group led by `pid`, once the leader itself was reaped.
///
/// Only does something on `cfg(unix)`. This is a synchronous call, usable from `Drop`.
pub(crate) fn kill_process_group(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::send(pid, true, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use std::io;

    pub(super) fn send(pid: u32, process_group: bool, sig: Signal) -> io::Result<()> {
        let pid = Pid::from_raw(pid as i32);
        let result = match process_group {
            true => signal::killpg(pid, sig),
            false => signal::kill(pid, sig),
        };
        match result {
            Ok(()) => Ok(()),
            // No such process (group). It is already gone.
            Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}
