//! Child reaping.
//!
//! One SIGCHLD delivery may stand for any number of exited children, so the
//! reaper always drains until the kernel reports nothing left.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error};

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process ID
    pub pid: u32,
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// A normal exit with `code`.
    pub fn exited(pid: u32, code: i32) -> Self {
        Self {
            pid,
            code: Some(code),
            signal: None,
        }
    }

    /// Death by `signal`.
    pub fn signaled(pid: u32, signal: i32) -> Self {
        Self {
            pid,
            code: None,
            signal: Some(signal),
        }
    }

    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Translate a wait status, skipping stop and continue reports.
fn exit_status(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(pid, code) => Some(ExitStatus::exited(pid.as_raw() as u32, code)),
        WaitStatus::Signaled(pid, sig, _) => Some(ExitStatus::signaled(pid.as_raw() as u32, sig as i32)),
        _ => None,
    }
}

/// Collect every child that has terminated, without blocking.
///
/// Stops when no more children are waiting or none exist. Any other wait
/// error is logged and ends this drain; whatever was collected so far is
/// still returned.
pub fn reap_children() -> Vec<ExitStatus> {
    let mut statuses = Vec::new();

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(status) => {
                if let Some(exit) = exit_status(status) {
                    debug!(pid = exit.pid, code = ?exit.code, signal = ?exit.signal, "Reaped child");
                    statuses.push(exit);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "waitpid failed, abandoning this reap pass");
                break;
            }
        }
    }

    statuses
}
