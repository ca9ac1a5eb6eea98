//! Process manager for ssh tunnel clients.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::errors::SpawnError;
use super::models::ProcessHandle;
use crate::config::{MachineEnv, Settings, StatePaths};
use crate::killer::{kill_process_group, KillError};
use crate::ports::TunnelSpawner;

/// Everything needed to build a tunnel client command line.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub binary: PathBuf,
    pub user: String,
    pub host: Ipv4Addr,
    pub identity_file: PathBuf,
    pub connect_timeout: Duration,
    pub connection_attempts: u32,
    /// How long the client must stay up before it counts as running.
    pub grace_period: Duration,
    /// Where captured client output is written.
    pub paths: StatePaths,
}

impl SshOptions {
    pub fn new(env: &MachineEnv, settings: &Settings, paths: &StatePaths) -> Self {
        Self {
            binary: settings.ssh_binary.clone(),
            user: settings.ssh_user.clone(),
            host: env.host_ip,
            identity_file: env.identity_file(),
            connect_timeout: settings.connect_timeout(),
            connection_attempts: settings.connection_attempts,
            grace_period: settings.spawn_grace(),
            paths: paths.clone(),
        }
    }

    /// Arguments forwarding local `port` to `localhost:port` on the remote side.
    ///
    /// Host keys are not verified: the remote is an ephemeral dev VM whose key changes
    /// whenever it is recreated.
    pub fn args(&self, port: u16) -> Vec<String> {
        let options = [
            "BatchMode=yes".to_string(),
            "PasswordAuthentication=no".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectionAttempts={}", self.connection_attempts),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "ControlMaster=no".to_string(),
            "ControlPath=none".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
        ];

        let mut args = Vec::with_capacity(options.len() * 2 + 6);
        for option in options {
            args.push("-o".to_string());
            args.push(option);
        }
        args.extend([
            "-i".to_string(),
            self.identity_file.display().to_string(),
            "-N".to_string(),
            "-L".to_string(),
            format!("{}:localhost:{}", port, port),
            format!("{}@{}", self.user, self.host),
        ]);
        args
    }
}

struct ManagedTunnel {
    child: Child,
    output: PathBuf,
}

/// Starts ssh clients in their own process groups and kills them by group.
///
/// Once a client passes the grace period it is not watched any more; the child is only
/// kept so it can be reaped after a kill.
pub struct SshTunnelController {
    options: SshOptions,
    children: HashMap<ProcessHandle, ManagedTunnel>,
}

impl SshTunnelController {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            children: HashMap::new(),
        }
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }

    fn launch(&self, port: u16) -> Result<(Child, PathBuf), SpawnError> {
        let output = self.options.paths.tunnel_output(port);
        let stdout = File::create(&output).map_err(SpawnError::Launch)?;
        let stderr = stdout.try_clone().map_err(SpawnError::Launch)?;

        let child = Command::new(&self.options.binary)
            .args(self.options.args(port))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| {
                let _ = fs::remove_file(&output);
                if e.kind() == io::ErrorKind::NotFound {
                    SpawnError::ClientNotFound(self.options.binary.display().to_string())
                } else {
                    SpawnError::Launch(e)
                }
            })?;

        Ok((child, output))
    }
}

impl TunnelSpawner for SshTunnelController {
    async fn spawn(&mut self, port: u16) -> Result<ProcessHandle, SpawnError> {
        let (child, output) = self.launch(port)?;
        let handle = ProcessHandle::new(child.id());
        debug!(port, pgid = handle.pgid(), "Tunnel client launched");

        // Owned before the grace period so a cancelled spawn is still killed by kill_all.
        self.children.insert(handle, ManagedTunnel { child, output });

        tokio::time::sleep(self.options.grace_period).await;

        let Some(mut managed) = self.children.remove(&handle) else {
            return Err(SpawnError::Launch(io::Error::new(
                io::ErrorKind::NotFound,
                format!("tunnel client {} is no longer tracked", handle),
            )));
        };

        match managed.child.try_wait() {
            Ok(None) => {
                info!(port, pgid = handle.pgid(), host = %self.options.host, "Tunnel running");
                self.children.insert(handle, managed);
                Ok(handle)
            }
            Ok(Some(status)) => {
                let captured = read_output(&managed.output);
                let _ = fs::remove_file(&managed.output);
                debug!(port, ?status, output = %captured.trim(), "Tunnel client exited early");
                Err(classify_failure(port, status.code(), &captured))
            }
            Err(e) => {
                warn!(port, error = %e, "Could not poll tunnel client, killing it");
                let _ = kill_process_group(handle.pgid());
                let _ = managed.child.wait();
                let _ = fs::remove_file(&managed.output);
                Err(SpawnError::Launch(e))
            }
        }
    }

    fn kill(&mut self, handle: ProcessHandle) -> Result<(), KillError> {
        let result = kill_process_group(handle.pgid());

        if let Some(mut managed) = self.children.remove(&handle) {
            // Only block on the child when the signal was delivered.
            if result.is_ok() {
                let _ = managed.child.wait();
            } else {
                let _ = managed.child.try_wait();
            }
            let _ = fs::remove_file(&managed.output);
        }

        result.map(|_| ())
    }

    fn kill_all(&mut self) -> usize {
        let handles: Vec<ProcessHandle> = self.children.keys().copied().collect();
        for &handle in &handles {
            if let Err(e) = self.kill(handle) {
                warn!(pgid = handle.pgid(), error = %e, "Failed to kill tunnel client");
            }
        }
        handles.len()
    }
}

impl Drop for SshTunnelController {
    fn drop(&mut self) {
        let killed = self.kill_all();
        if killed > 0 {
            debug!(count = killed, "Killed remaining tunnel clients");
        }
    }
}

/// Captured client output. Bytes that are not UTF-8 are replaced, not dropped.
fn read_output(path: &Path) -> String {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

// ============================================================================
// Output Parsing
// ============================================================================

const UNREACHABLE_MARKERS: &[&str] = &[
    "connection refused",
    "timed out",
    "no route to host",
    "could not resolve",
    "network is unreachable",
];

/// Maps the output of a tunnel client that exited during the grace period to a
/// [`SpawnError`].
pub fn classify_failure(port: u16, code: Option<i32>, output: &str) -> SpawnError {
    let lower = output.to_lowercase();

    // ssh refuses low ports itself; the kernel refusing the bind reads "bind ...: Permission denied".
    if lower.contains("privileged ports can only be forwarded by root")
        || (lower.contains("bind") && lower.contains("permission denied") && port < 1024)
    {
        return SpawnError::PrivilegedPort { port };
    }

    if lower.contains("address already in use") || lower.contains("cannot listen to port") {
        return SpawnError::AddressInUse { port };
    }

    if lower.contains("permission denied (") || lower.contains("too many authentication failures") {
        return SpawnError::AuthenticationFailed { port };
    }

    if UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return SpawnError::HostUnreachable { port };
    }

    SpawnError::Exited {
        port,
        code,
        output: output.trim().to_string(),
    }
}
