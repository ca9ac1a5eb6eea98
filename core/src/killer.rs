//! Signal delivery for tunnel process groups and the daemon process.
//!
//! Tunnels are started in their own process group so that the client and anything it
//! forks can be terminated with a single `killpg`. A group that no longer exists is not
//! an error: tearing down an already-dead tunnel is a no-op.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::debug;

/// Poll interval while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that can occur while signalling a process or process group.
#[derive(Debug, Error)]
pub enum KillError {
    /// The id does not fit a platform pid.
    #[error("Invalid process id {0}")]
    InvalidPid(u32),

    /// The kernel refused to deliver the signal.
    #[error("Failed to send {signal} to {target} {pid}: {errno}")]
    Signal {
        target: &'static str,
        pid: u32,
        signal: Signal,
        errno: Errno,
    },
}

fn to_pid(pid: u32) -> Result<Pid, KillError> {
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(Pid::from_raw)
        .ok_or(KillError::InvalidPid(pid))
}

/// Sends SIGKILL to every process in the group `pgid`.
///
/// Returns `Ok(false)` if the group no longer exists.
pub fn kill_process_group(pgid: u32) -> Result<bool, KillError> {
    let pid = to_pid(pgid)?;
    match signal::killpg(pid, Signal::SIGKILL) {
        Ok(()) => {
            debug!(pgid, "SIGKILL sent to process group");
            Ok(true)
        }
        Err(Errno::ESRCH) => {
            debug!(pgid, "Process group already gone");
            Ok(false)
        }
        Err(errno) => Err(KillError::Signal {
            target: "process group",
            pid: pgid,
            signal: Signal::SIGKILL,
            errno,
        }),
    }
}

/// Returns true if a process with `pid` exists.
pub fn process_alive(pid: u32) -> bool {
    match to_pid(pid) {
        // EPERM means the process exists but belongs to someone else.
        Ok(pid) => matches!(signal::kill(pid, None), Ok(()) | Err(Errno::EPERM)),
        Err(_) => false,
    }
}

/// Sends `sig` to a single process. Returns `Ok(false)` if the process is gone.
pub fn send_signal(pid: u32, sig: Signal) -> Result<bool, KillError> {
    match signal::kill(to_pid(pid)?, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(KillError::Signal {
            target: "process",
            pid,
            signal: sig,
            errno,
        }),
    }
}

/// Asks a process to exit with SIGTERM, escalating to SIGKILL after `timeout`.
///
/// Returns true once the process is gone.
pub fn terminate(pid: u32, timeout: Duration) -> Result<bool, KillError> {
    if !send_signal(pid, Signal::SIGTERM)? {
        return Ok(true);
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return Ok(true);
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }

    debug!(pid, "Process ignored SIGTERM, sending SIGKILL");
    send_signal(pid, Signal::SIGKILL)?;
    std::thread::sleep(EXIT_POLL_INTERVAL);
    Ok(!process_alive(pid))
}
