//! PortBridge Core Library
//!
//! Keeps local port forwards in step with the containers running on a
//! docker-machine VM. Provides functionality to:
//! - Discover published container ports and follow start/stop events
//! - Spawn and kill `ssh -L` tunnel clients in their own process groups
//! - Persist the forwarded ports and recover from a crashed daemon
//! - Manage the daemon's PID file and user settings
//!
//! # Architecture
//! This library follows hexagonal architecture (ports & adapters):
//! - `ports`: Trait definitions (interfaces)
//! - `adapters`, `docker`, `tunnel`: External system implementations
//! - `application`: The reconciliation loop

// Hexagonal architecture layers
pub mod adapters;
pub mod application;
pub mod ports;

pub mod config;
pub mod daemon;
pub mod docker;
pub mod error;
pub mod killer;
pub mod tunnel;

// Re-export commonly used types
pub use adapters::TcpPortProbe;
pub use application::{Reconciler, ReconcilerState};
pub use config::{ConfigError, MachineEnv, Settings, SettingsStore, StatePaths};
pub use daemon::PidFile;
pub use docker::{ContainerEvent, ContainerPorts, DockerRuntime, RuntimeError};
pub use error::{Error, Result};
pub use tunnel::{CreateOutcome, SpawnError, SshOptions, SshTunnelController, StateStore, TunnelRegistry};
