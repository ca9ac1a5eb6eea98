//! The daemon's own PID file and stopping a running daemon.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::StatePaths;
use crate::error::{Error, Result};
use crate::killer::{process_alive, terminate};
use crate::tunnel::state_store::write_atomic;
use crate::tunnel::StateStore;

/// How long `stop` waits for the daemon to exit after SIGTERM.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// PID file of the running daemon.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(paths: &StatePaths) -> Self {
        Self::with_path(paths.pid_file())
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded pid, if the file exists.
    pub fn read(&self) -> Result<Option<u32>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        content
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|e| Error::CorruptState {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        write_atomic(&self.path, &format!("{}\n", pid))?;
        debug!(pid, path = %self.path.display(), "PID file written");
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Pid of a live daemon. A file naming a dead or unreadable pid is deleted.
    pub fn running_pid(&self) -> Result<Option<u32>> {
        let pid = match self.read() {
            Ok(Some(pid)) => pid,
            Ok(None) => return Ok(None),
            Err(Error::CorruptState { reason, .. }) => {
                warn!(path = %self.path.display(), reason = %reason, "Removing unreadable PID file");
                self.remove()?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if process_alive(pid) {
            return Ok(Some(pid));
        }

        debug!(pid, "Removing stale PID file");
        self.remove()?;
        Ok(None)
    }

    /// Delete the file only if it still names `pid`.
    pub fn remove_if_owned(&self, pid: u32) -> Result<()> {
        match self.read() {
            Ok(Some(recorded)) if recorded == pid => self.remove(),
            Ok(_) => Ok(()),
            Err(Error::CorruptState { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Stop the daemon recorded in `paths`, then kill any tunnels it left behind.
///
/// Returns the pid that was stopped, or `None` if no daemon was running.
pub fn stop(paths: &StatePaths, timeout: Duration) -> Result<Option<u32>> {
    let pid_file = PidFile::new(paths);
    let Some(pid) = pid_file.running_pid()? else {
        return Ok(None);
    };

    let exited = terminate(pid, timeout).map_err(|e| Error::Daemon(e.to_string()))?;
    if !exited {
        return Err(Error::Daemon(format!("process {} did not exit", pid)));
    }

    pid_file.remove()?;
    let leftovers = StateStore::new(paths).cleanup_stale()?;
    info!(pid, leftovers, "Daemon stopped");
    Ok(Some(pid))
}
