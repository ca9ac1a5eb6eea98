//! Ports layer - Trait definitions (interfaces).
//!
//! This module defines the interfaces the tunnel manager uses
//! to interact with external systems. Implementations live in `adapters`,
//! `tunnel` and `docker`.

mod probe;
mod runtime;
mod spawner;

pub use probe::PortProbe;
pub use runtime::{ContainerRuntime, EventFeed};
pub use spawner::TunnelSpawner;
