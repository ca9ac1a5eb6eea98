//! Tunnel spawner port (interface).

use crate::killer::KillError;
use crate::tunnel::{ProcessHandle, SpawnError};

/// Port for starting and killing tunnel client processes.
///
/// Implementations own the spawned processes; callers only ever see a [`ProcessHandle`].
pub trait TunnelSpawner: Send {
    /// Start a tunnel forwarding local `port` to the same port on the remote host.
    ///
    /// Resolves once the client has survived the grace period, or with the
    /// classified reason it exited.
    fn spawn(
        &mut self,
        port: u16,
    ) -> impl std::future::Future<Output = Result<ProcessHandle, SpawnError>> + Send;

    /// Forcefully terminate the process group behind `handle`.
    ///
    /// A group that is already gone is not an error.
    fn kill(&mut self, handle: ProcessHandle) -> Result<(), KillError>;

    /// Kill every process this spawner still owns, including clients whose spawn was
    /// cancelled during the grace period. Returns how many were killed.
    fn kill_all(&mut self) -> usize;
}
