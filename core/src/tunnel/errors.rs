//! Tunnel spawn failures.

use thiserror::Error;

/// Why a tunnel client could not be brought up for a port.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The tunnel client executable does not exist.
    #[error("Tunnel client {0} not found")]
    ClientNotFound(String),

    /// The tunnel client could not be started.
    #[error("Failed to launch tunnel client: {0}")]
    Launch(#[source] std::io::Error),

    /// Binding a port below 1024 requires root.
    #[error("Port {port} is privileged and can only be forwarded by root")]
    PrivilegedPort { port: u16 },

    /// Something grabbed the local port between the probe and the bind.
    #[error("Local port {port} is already in use")]
    AddressInUse { port: u16 },

    /// The remote host rejected the identity.
    #[error("Authentication to the remote host failed while forwarding port {port}")]
    AuthenticationFailed { port: u16 },

    /// The remote host could not be reached.
    #[error("Remote host unreachable while forwarding port {port}")]
    HostUnreachable { port: u16 },

    /// The client exited during the grace period for another reason.
    #[error("Tunnel for port {port} exited with {}: {output}", code.map_or_else(|| "a signal".to_string(), |c| format!("status {}", c)))]
    Exited {
        port: u16,
        code: Option<i32>,
        output: String,
    },
}

impl SpawnError {
    /// A short remediation for the operator, if one is known.
    pub fn hint(&self) -> Option<String> {
        match self {
            SpawnError::ClientNotFound(binary) => Some(format!(
                "Install an ssh client or point `sshBinary` in ~/.portbridge/config.json at one (looked for {})",
                binary
            )),
            SpawnError::PrivilegedPort { port } => Some(format!(
                "Port {} is below 1024: restart portbridge as root, or publish the container on a higher port",
                port
            )),
            SpawnError::AddressInUse { port } => Some(format!(
                "Another process took port {} on this machine; free it and restart the container",
                port
            )),
            SpawnError::AuthenticationFailed { .. } => Some(
                "Re-authenticate with the machine: `docker-machine regenerate-certs <machine>`"
                    .to_string(),
            ),
            SpawnError::HostUnreachable { .. } => Some(
                "Check the remote VM is running: `docker-machine status <machine>`".to_string(),
            ),
            SpawnError::Launch(_) | SpawnError::Exited { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_display() {
        let err = SpawnError::PrivilegedPort { port: 80 };
        assert!(err.to_string().contains("80"));

        let err = SpawnError::Exited {
            port: 9000,
            code: Some(255),
            output: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Tunnel for port 9000 exited with status 255: boom");

        let err = SpawnError::Exited {
            port: 9000,
            code: None,
            output: String::new(),
        };
        assert!(err.to_string().contains("a signal"));
    }

    #[test]
    fn test_hints() {
        assert!(SpawnError::PrivilegedPort { port: 80 }
            .hint()
            .unwrap()
            .contains("root"));
        assert!(SpawnError::HostUnreachable { port: 1 }.hint().is_some());
        assert!(SpawnError::Exited {
            port: 1,
            code: Some(1),
            output: String::new()
        }
        .hint()
        .is_none());
    }
}
