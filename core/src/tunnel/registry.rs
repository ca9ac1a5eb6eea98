//! Registry of forwarded ports.
//!
//! The registry is the single source of truth for what is currently forwarded. It is
//! owned by the control task and only mutated through [`TunnelRegistry::try_create`],
//! [`TunnelRegistry::remove`] and [`TunnelRegistry::remove_all`].

use std::collections::BTreeMap;

use tracing::{error, info, warn};

use super::models::{CreateOutcome, Tunnel};
use super::state_store::StateStore;
use crate::error::Result;
use crate::ports::{PortProbe, TunnelSpawner};

/// Maps host ports to running tunnels.
pub struct TunnelRegistry<S: TunnelSpawner, P: PortProbe> {
    tunnels: BTreeMap<u16, Tunnel>,
    spawner: S,
    probe: P,
    store: StateStore,
}

impl<S: TunnelSpawner, P: PortProbe> TunnelRegistry<S, P> {
    pub fn new(spawner: S, probe: P, store: StateStore) -> Self {
        Self {
            tunnels: BTreeMap::new(),
            spawner,
            probe,
            store,
        }
    }

    pub fn get(&self, port: u16) -> Option<&Tunnel> {
        self.tunnels.get(&port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.tunnels.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Tunnels ordered by port.
    pub fn tunnels(&self) -> impl Iterator<Item = &Tunnel> {
        self.tunnels.values()
    }

    /// Ports whose tunnel was created for `container_name`.
    pub fn ports_owned_by(&self, container_name: &str) -> Vec<u16> {
        self.tunnels
            .values()
            .filter(|t| t.container_name == container_name)
            .map(|t| t.port)
            .collect()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Forward `port` for `container_name` unless it is already forwarded or taken.
    pub async fn try_create(&mut self, port: u16, container_name: &str) -> CreateOutcome {
        if let Some(existing) = self.tunnels.get(&port) {
            warn!(
                port,
                container = container_name,
                owner = %existing.container_name,
                "Port already forwarded"
            );
            return CreateOutcome::AlreadyForwarded {
                owner: existing.container_name.clone(),
            };
        }

        if self.probe.is_port_in_use(port) {
            error!(port, container = container_name, "Local port already in use, not forwarding");
            eprintln!(
                "portbridge: cannot forward port {} of container {}: something on this machine already listens on it",
                port, container_name
            );
            return CreateOutcome::PortConflict;
        }

        match self.spawner.spawn(port).await {
            Ok(handle) => {
                info!(port, container = container_name, pgid = handle.pgid(), "Port forwarded");
                self.tunnels
                    .insert(port, Tunnel::new(port, container_name, handle));
                CreateOutcome::Created
            }
            Err(e) => {
                error!(port, container = container_name, error = %e, "Failed to start tunnel");
                match e.hint() {
                    Some(hint) => eprintln!("portbridge: {}. {}", e, hint),
                    None => eprintln!("portbridge: {}", e),
                }
                CreateOutcome::SpawnFailed(e)
            }
        }
    }

    /// Stop forwarding `port`. Returns false if it was not forwarded.
    pub fn remove(&mut self, port: u16) -> bool {
        let Some(tunnel) = self.tunnels.remove(&port) else {
            return false;
        };

        if let Err(e) = self.spawner.kill(tunnel.handle()) {
            warn!(port, pgid = tunnel.handle().pgid(), error = %e, "Failed to kill tunnel");
        }
        info!(port, container = %tunnel.container_name, "Port no longer forwarded");
        true
    }

    /// Stop every tunnel and any client the spawner still owns, then clear the
    /// persisted state.
    pub fn remove_all(&mut self) {
        let ports: Vec<u16> = self.tunnels.keys().copied().collect();
        for port in ports {
            self.remove(port);
        }

        let untracked = self.spawner.kill_all();
        if untracked > 0 {
            warn!(count = untracked, "Killed tunnel clients that never reached the registry");
        }

        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to clear tunnel state files");
        }
    }

    /// Persist the current set of tunnels.
    pub fn flush(&self) -> Result<()> {
        self.store.flush(self.tunnels.values())
    }
}
