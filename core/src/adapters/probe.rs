//! TCP connect probe for local ports.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use crate::ports::PortProbe;

/// Default connect timeout for the probe.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Detects listeners on `127.0.0.1` by attempting a TCP connection.
///
/// The answer is only a hint: a port can be taken right after the probe. The tunnel
/// client's own bind is authoritative.
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    timeout: Duration,
}

impl TcpPortProbe {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProbe for TcpPortProbe {
    fn is_port_in_use(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}
