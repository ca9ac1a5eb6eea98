//! Tunnel lifecycle: spawning ssh forwards, tracking them, persisting them.
//!
//! This module provides:
//! - The registry of forwarded ports (one tunnel per port)
//! - Process management for the ssh tunnel clients
//! - Persistence of the registry and crash recovery

pub mod errors;
pub mod models;
pub mod process_manager;
pub mod registry;
pub mod state_store;

// Re-export commonly used types
pub use errors::SpawnError;
pub use models::{CreateOutcome, ProcessHandle, Tunnel};
pub use process_manager::{classify_failure, SshOptions, SshTunnelController};
pub use registry::TunnelRegistry;
pub use state_store::{read_port_list, PortEntry, StateStore};
