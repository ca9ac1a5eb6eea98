//! Persistence of the tunnel registry.
//!
//! Two files mirror the registry after every change:
//! - the port list, one `container port` line per tunnel, printed by `portbridge ls`;
//! - the pid list, one process-group id per line, used to clean up after a crash.
//!
//! Both are replaced by rename so concurrent readers never see a partial file.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::models::Tunnel;
use crate::config::StatePaths;
use crate::error::{Error, Result};
use crate::killer::kill_process_group;

/// One line of the port list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortEntry {
    pub container_name: String,
    pub port: u16,
}

impl PortEntry {
    pub fn new(container_name: impl Into<String>, port: u16) -> Self {
        Self {
            container_name: container_name.into(),
            port,
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let container_name = fields.next()?;
        let port = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self::new(container_name, port))
    }
}

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<32} {}", self.container_name, self.port)
    }
}

impl From<&Tunnel> for PortEntry {
    fn from(tunnel: &Tunnel) -> Self {
        Self::new(tunnel.container_name.clone(), tunnel.port)
    }
}

/// Writes and cleans up the registry's state files.
#[derive(Debug, Clone)]
pub struct StateStore {
    ports_path: PathBuf,
    pids_path: PathBuf,
}

impl StateStore {
    pub fn new(paths: &StatePaths) -> Self {
        Self::with_paths(paths.ports_file(), paths.tunnel_pids_file())
    }

    /// Create a store with custom paths (for testing).
    pub fn with_paths(ports_path: PathBuf, pids_path: PathBuf) -> Self {
        Self {
            ports_path,
            pids_path,
        }
    }

    pub fn ports_path(&self) -> &Path {
        &self.ports_path
    }

    pub fn pids_path(&self) -> &Path {
        &self.pids_path
    }

    /// Write the snapshot of `tunnels`, or delete both files when there are none.
    pub fn flush<'a>(&self, tunnels: impl IntoIterator<Item = &'a Tunnel>) -> Result<()> {
        let mut entries = String::new();
        let mut pids = String::new();
        for tunnel in tunnels {
            entries.push_str(&format!("{}\n", PortEntry::from(tunnel)));
            pids.push_str(&format!("{}\n", tunnel.handle().pgid()));
        }

        if entries.is_empty() {
            return self.clear();
        }

        write_atomic(&self.ports_path, &entries)?;
        write_atomic(&self.pids_path, &pids)?;
        debug!(path = %self.ports_path.display(), "Tunnel state written");
        Ok(())
    }

    /// Delete both state files. Missing files are fine.
    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.ports_path)?;
        remove_if_exists(&self.pids_path)?;
        Ok(())
    }

    /// Process-group ids recorded by the last flush.
    pub fn read_pids(&self) -> Result<Vec<u32>> {
        let Some(content) = read_if_exists(&self.pids_path)? else {
            return Ok(Vec::new());
        };

        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse::<u32>().map_err(|e| Error::CorruptState {
                    path: self.pids_path.clone(),
                    reason: format!("{:?}: {}", line, e),
                })
            })
            .collect()
    }

    /// Kill tunnels left behind by a previous daemon that did not shut down cleanly.
    ///
    /// Must run before the registry is populated. Returns the number of process groups
    /// that were still alive.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let pids = match self.read_pids() {
            Ok(pids) => pids,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable pid file");
                Vec::new()
            }
        };

        let mut killed = 0;
        for pgid in pids {
            match kill_process_group(pgid) {
                Ok(true) => killed += 1,
                Ok(false) => {}
                Err(e) => warn!(pgid, error = %e, "Failed to kill stale tunnel"),
            }
        }

        if killed > 0 {
            info!(count = killed, "Killed stale tunnels from a previous run");
        }

        self.clear()?;
        Ok(killed)
    }
}

/// Read a port list written by [`StateStore::flush`]. `None` if the file does not exist.
pub fn read_port_list(path: &Path) -> Result<Option<Vec<PortEntry>>> {
    let Some(content) = read_if_exists(path)? else {
        return Ok(None);
    };

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            PortEntry::parse(line).ok_or_else(|| Error::CorruptState {
                path: path.to_path_buf(),
                reason: format!("unexpected line {:?}", line),
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Write to a sibling temp file, sync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, path)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn read_if_exists(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
