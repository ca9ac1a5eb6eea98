//! Tunnel data models.

use std::fmt;

use super::errors::SpawnError;

/// Identifies the process group of a spawned tunnel client.
///
/// The group id equals the pid of the client, which is started as a group leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessHandle(u32);

impl ProcessHandle {
    pub fn new(pgid: u32) -> Self {
        Self(pgid)
    }

    pub fn pgid(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A running forward of one local port to the same port on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    /// Host-side TCP port, unique across the registry.
    pub port: u16,
    /// Container that published the port.
    pub container_name: String,
    handle: ProcessHandle,
}

impl Tunnel {
    pub fn new(port: u16, container_name: impl Into<String>, handle: ProcessHandle) -> Self {
        Self {
            port,
            container_name: container_name.into(),
            handle,
        }
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }
}

/// Result of asking the registry to forward a port.
#[derive(Debug)]
pub enum CreateOutcome {
    /// A tunnel for the port already exists; nothing was spawned.
    AlreadyForwarded { owner: String },
    /// Something on this machine already listens on the port; nothing was spawned.
    PortConflict,
    /// The tunnel client failed to come up.
    SpawnFailed(SpawnError),
    /// A new tunnel is running.
    Created,
}

impl CreateOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created)
    }
}
