//! Container runtime port (interface).

use tokio::sync::mpsc;

use crate::docker::{ContainerEvent, ContainerPorts, RuntimeError};

/// Items delivered by the runtime's event feed.
pub type EventFeed = mpsc::Receiver<Result<ContainerEvent, RuntimeError>>;

/// Port for querying containers and following their lifecycle.
pub trait ContainerRuntime: Send + Sync {
    /// List running containers with their published host ports.
    fn running_containers(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ContainerPorts>, RuntimeError>> + Send;

    /// Published host ports of a single container, by name or id.
    fn container_ports(
        &self,
        container: &str,
    ) -> impl std::future::Future<Output = Result<ContainerPorts, RuntimeError>> + Send;

    /// Start a background reader of the runtime's event stream.
    ///
    /// A transport failure is delivered as the last item before the feed closes.
    fn subscribe(&self) -> EventFeed;
}
