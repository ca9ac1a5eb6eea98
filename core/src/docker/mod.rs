//! Docker boundary: listing containers, reading their published ports,
//! and following their lifecycle events.

pub mod errors;
pub mod models;
pub mod runtime;

pub use errors::RuntimeError;
pub use models::{published_ports, ContainerAction, ContainerEvent, ContainerPorts};
pub use runtime::DockerRuntime;
