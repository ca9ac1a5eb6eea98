//! Reconciliation of forwarded ports against container lifecycle.

use std::collections::BTreeSet;

use tracing::{debug, error, info, warn};

use crate::docker::{ContainerAction, ContainerEvent, RuntimeError};
use crate::error::Result;
use crate::ports::{ContainerRuntime, EventFeed, PortProbe, TunnelSpawner};
use crate::tunnel::TunnelRegistry;

/// Lifecycle of the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Forwarding the ports of containers that were already running.
    Bootstrapping,
    /// Reacting to container events.
    Streaming,
    /// Terminal: the feed failed or the daemon is shutting down.
    Stopped,
}

/// Owns the tunnel registry for the lifetime of the daemon.
///
/// Every tunnel is torn down exactly once: by [`Reconciler::shutdown`], or when the
/// reconciler is dropped on any other exit path.
pub struct Reconciler<R: ContainerRuntime, S: TunnelSpawner, P: PortProbe> {
    runtime: R,
    registry: TunnelRegistry<S, P>,
    state: ReconcilerState,
    torn_down: bool,
}

impl<R: ContainerRuntime, S: TunnelSpawner, P: PortProbe> Reconciler<R, S, P> {
    pub fn new(runtime: R, registry: TunnelRegistry<S, P>) -> Self {
        Self {
            runtime,
            registry,
            state: ReconcilerState::Bootstrapping,
            torn_down: false,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn registry(&self) -> &TunnelRegistry<S, P> {
        &self.registry
    }

    /// Recover from a crashed predecessor, subscribe to events, forward existing
    /// containers, then follow events until the feed fails.
    pub async fn run(&mut self) -> Result<()> {
        self.registry.store().cleanup_stale()?;

        // Subscribe first: events raised while bootstrap forwards ports queue in the feed.
        let mut feed = self.runtime.subscribe();
        self.bootstrap().await?;
        self.stream(&mut feed).await
    }

    /// Forward every published port of the running containers.
    ///
    /// A port that cannot be forwarded is skipped; failing to list containers is fatal.
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.state = ReconcilerState::Bootstrapping;

        let containers = match self.runtime.running_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                self.state = ReconcilerState::Stopped;
                return Err(e.into());
            }
        };

        for container in &containers {
            for &port in &container.ports {
                self.registry.try_create(port, &container.name).await;
            }
        }
        self.flush();

        info!(
            containers = containers.len(),
            tunnels = self.registry.len(),
            "Bootstrap complete"
        );
        self.state = ReconcilerState::Streaming;
        Ok(())
    }

    /// Consume the feed one item at a time.
    ///
    /// Returns only when the connection to the runtime is lost or the feed ends.
    pub async fn stream(&mut self, feed: &mut EventFeed) -> Result<()> {
        self.state = ReconcilerState::Streaming;

        loop {
            let failure = match feed.recv().await {
                Some(Ok(event)) => self.handle_event(event).await.err(),
                Some(Err(e)) if e.is_transport() => Some(e),
                Some(Err(e)) => {
                    warn!(error = %e, "Skipping event");
                    None
                }
                None => Some(RuntimeError::StreamClosed),
            };

            if let Some(e) = failure {
                error!(error = %e, "Lost the Docker event stream");
                self.state = ReconcilerState::Stopped;
                return Err(e.into());
            }
        }
    }

    /// Apply one container event. Only transport failures are returned.
    pub async fn handle_event(&mut self, event: ContainerEvent) -> std::result::Result<(), RuntimeError> {
        match event.action {
            ContainerAction::Start => {
                let container = match self.runtime.container_ports(&event.container).await {
                    Ok(container) => container,
                    Err(e) if e.is_transport() => return Err(e),
                    Err(e) => {
                        warn!(container = %event.container, error = %e, "Cannot inspect started container");
                        return Ok(());
                    }
                };

                for &port in &container.ports {
                    self.registry.try_create(port, &event.container).await;
                }
                self.flush();
            }
            ContainerAction::Stop => {
                let mut ports: BTreeSet<u16> = self
                    .registry
                    .ports_owned_by(&event.container)
                    .into_iter()
                    .collect();

                match self.runtime.container_ports(&event.container).await {
                    Ok(container) => ports.extend(container.ports),
                    Err(e) if e.is_transport() => return Err(e),
                    Err(e) => {
                        debug!(container = %event.container, error = %e, "Cannot inspect stopped container")
                    }
                }

                for port in ports {
                    match self.registry.get(port) {
                        Some(tunnel) if tunnel.container_name != event.container => {
                            warn!(
                                port,
                                container = %event.container,
                                owner = %tunnel.container_name,
                                "Port forwarded for another container, keeping it"
                            );
                        }
                        Some(_) => {
                            self.registry.remove(port);
                        }
                        None => {}
                    }
                }
                self.flush();
            }
            ContainerAction::Other(action) => {
                debug!(container = %event.container, action = %action, "Ignoring event");
            }
        }
        Ok(())
    }

    /// Kill every tunnel and delete the state files. Runs at most once.
    pub fn shutdown(&mut self) {
        self.state = ReconcilerState::Stopped;
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let count = self.registry.len();
        self.registry.remove_all();
        info!(tunnels = count, "All tunnels stopped");
    }

    fn flush(&self) {
        if let Err(e) = self.registry.flush() {
            error!(error = %e, "Failed to write tunnel state");
        }
    }
}

impl<R: ContainerRuntime, S: TunnelSpawner, P: PortProbe> Drop for Reconciler<R, S, P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
