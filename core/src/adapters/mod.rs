//! Adapters layer - External system implementations.
//!
//! The tunnel controller and the Docker runtime are large enough to live in their own
//! modules (`tunnel`, `docker`); small adapters live here.

pub mod probe;

pub use probe::TcpPortProbe;
