//! Local port probe port (interface).

/// Port for checking whether a local TCP port is already bound.
pub trait PortProbe: Send + Sync {
    /// Returns true if something accepts connections on `127.0.0.1:port`.
    fn is_port_in_use(&self, port: u16) -> bool;
}
