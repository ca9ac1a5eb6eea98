//! Environment and settings for the tunnel daemon.
//!
//! Two layers of configuration exist:
//! - [`MachineEnv`]: the docker-machine environment (`DOCKER_HOST`, `DOCKER_CERT_PATH`, ...),
//!   read once at startup. Anything missing here is fatal.
//! - [`Settings`]: optional tuning stored as JSON at `~/.portbridge/config.json`.
//!   Every field has a default, so a missing file is not an error.
//!
//! [`StatePaths`] derives every runtime file location from the state directory.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "PORTBRIDGE_STATE_DIR";

const MACHINE_NAME_VAR: &str = "DOCKER_MACHINE_NAME";
const DOCKER_HOST_VAR: &str = "DOCKER_HOST";
const CERT_PATH_VAR: &str = "DOCKER_CERT_PATH";
const TLS_VERIFY_VAR: &str = "DOCKER_TLS_VERIFY";

/// File name of the ssh identity docker-machine generates next to the TLS certs.
const IDENTITY_FILE: &str = "id_rsa";

/// TLS material docker-machine places in the cert path.
const TLS_FILES: [&str; 3] = ["ca.pem", "cert.pem", "key.pem"];

/// Errors raised while reading the environment or settings. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not set. Run `eval $(docker-machine env <machine>)` in this shell and try again")]
    MissingVariable(&'static str),

    #[error("No IPv4 address found in DOCKER_HOST={0}. Run `eval $(docker-machine env <machine>)` and try again")]
    InvalidDockerHost(String),

    #[error("DOCKER_TLS_VERIFY must be 1 or 0, got {0:?}")]
    InvalidTlsVerify(String),

    #[error("Credential file {} is missing. Run `docker-machine regenerate-certs {machine}` and `eval $(docker-machine env {machine})`", path.display())]
    MissingCredential { machine: String, path: PathBuf },

    #[error("Could not determine home directory")]
    HomeDirNotFound,

    #[error("Invalid settings file {}: {reason}", path.display())]
    Settings { path: PathBuf, reason: String },
}

// ============================================================================
// Machine environment
// ============================================================================

/// The docker-machine connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineEnv {
    /// Logical machine name (`DOCKER_MACHINE_NAME`).
    pub machine_name: String,
    /// Docker endpoint URL (`DOCKER_HOST`), e.g. `tcp://192.168.99.100:2376`.
    pub docker_host: String,
    /// Remote address the tunnels connect to, taken from `docker_host`.
    pub host_ip: Ipv4Addr,
    /// Directory holding TLS material and the ssh identity (`DOCKER_CERT_PATH`).
    pub cert_path: PathBuf,
    /// Whether the Docker API is reached over verified TLS (`DOCKER_TLS_VERIFY`).
    pub tls_verify: bool,
}

impl MachineEnv {
    /// Reads the machine environment from the current process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the machine environment through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingVariable(name))
        };

        let machine_name = require(MACHINE_NAME_VAR)?;
        let docker_host = require(DOCKER_HOST_VAR)?;
        let cert_path = PathBuf::from(require(CERT_PATH_VAR)?);
        let tls_verify = parse_tls_verify(&require(TLS_VERIFY_VAR)?)?;

        let host_ip = extract_ipv4(&docker_host)
            .ok_or_else(|| ConfigError::InvalidDockerHost(docker_host.clone()))?;

        Ok(Self {
            machine_name,
            docker_host,
            host_ip,
            cert_path,
            tls_verify,
        })
    }

    /// Path of the ssh private key used by the tunnels.
    pub fn identity_file(&self) -> PathBuf {
        self.cert_path.join(IDENTITY_FILE)
    }

    /// Paths of the TLS client material (`ca`, `cert`, `key`).
    pub fn tls_files(&self) -> [PathBuf; 3] {
        TLS_FILES.map(|name| self.cert_path.join(name))
    }

    /// Checks that the credential files referenced by the environment exist.
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        let mut required = vec![self.identity_file()];
        if self.tls_verify {
            required.extend(self.tls_files());
        }

        match required.into_iter().find(|path| !path.is_file()) {
            Some(path) => Err(ConfigError::MissingCredential {
                machine: self.machine_name.clone(),
                path,
            }),
            None => Ok(()),
        }
    }
}

fn parse_tls_verify(value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(ConfigError::InvalidTlsVerify(other.to_string())),
    }
}

/// Extracts the first IPv4 address from a connection URL such as `tcp://192.168.99.100:2376`.
pub fn extract_ipv4(url: &str) -> Option<Ipv4Addr> {
    static IPV4: OnceLock<Regex> = OnceLock::new();
    let re = IPV4.get_or_init(|| {
        Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").expect("valid IPv4 pattern")
    });

    re.captures_iter(url)
        .filter_map(|caps| caps[1].parse::<Ipv4Addr>().ok())
        .next()
}

// ============================================================================
// Settings
// ============================================================================

/// Tunable settings stored in JSON format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Tunnel client executable.
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: PathBuf,

    /// Remote login user.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// How long a freshly spawned tunnel must survive before it counts as running.
    #[serde(default = "default_spawn_grace_ms")]
    pub spawn_grace_ms: u64,

    /// Passed to the tunnel client as `ConnectTimeout`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Passed to the tunnel client as `ConnectionAttempts`.
    #[serde(default = "default_connection_attempts")]
    pub connection_attempts: u32,

    /// Timeout of the local port-in-use probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Overrides the state directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_ssh_binary() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_ssh_user() -> String {
    "docker".to_string()
}

fn default_spawn_grace_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_connection_attempts() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    500
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            ssh_user: default_ssh_user(),
            spawn_grace_ms: default_spawn_grace_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            connection_attempts: default_connection_attempts(),
            probe_timeout_ms: default_probe_timeout_ms(),
            state_dir: None,
        }
    }
}

impl Settings {
    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Settings store backed by `~/.portbridge/config.json`.
pub struct SettingsStore {
    settings_path: PathBuf,
}

impl SettingsStore {
    /// Create a store with the default path.
    pub fn new() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
        Ok(Self {
            settings_path: home.join(".portbridge").join("config.json"),
        })
    }

    /// Create a store with a custom path (for testing).
    pub fn with_path(settings_path: PathBuf) -> Self {
        Self { settings_path }
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk.
    ///
    /// Returns defaults if the file doesn't exist.
    pub async fn load(&self) -> Result<Settings, ConfigError> {
        if !self.settings_path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&self.settings_path)
            .await
            .map_err(|e| self.invalid(format!("Failed to read settings: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| self.invalid(format!("Failed to parse settings: {}", e)))
    }

    /// Save settings to disk, writing a temp file and renaming it into place.
    pub async fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| self.invalid(format!("Failed to create settings directory: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| self.invalid(format!("Failed to serialize settings: {}", e)))?;

        let temp_path = self.settings_path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| self.invalid(format!("Failed to create temp settings file: {}", e)))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| self.invalid(format!("Failed to write settings: {}", e)))?;

        file.sync_all()
            .await
            .map_err(|e| self.invalid(format!("Failed to sync settings: {}", e)))?;

        fs::rename(&temp_path, &self.settings_path)
            .await
            .map_err(|e| self.invalid(format!("Failed to rename settings file: {}", e)))?;

        Ok(())
    }

    fn invalid(&self, reason: String) -> ConfigError {
        ConfigError::Settings {
            path: self.settings_path.clone(),
            reason,
        }
    }
}

// ============================================================================
// State paths
// ============================================================================

/// Well-known locations of the daemon's runtime files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    dir: PathBuf,
}

impl StatePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolves the state directory: `PORTBRIDGE_STATE_DIR`, then the settings file,
    /// then `$TMPDIR/portbridge`.
    pub fn resolve(settings: &Settings) -> Self {
        let dir = std::env::var_os(STATE_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| settings.state_dir.clone())
            .unwrap_or_else(|| std::env::temp_dir().join("portbridge"));
        Self::new(dir)
    }

    /// Creates the state directory if needed.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The daemon's own process id.
    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("portbridge.pid")
    }

    /// Human-readable list of forwarded ports.
    pub fn ports_file(&self) -> PathBuf {
        self.dir.join("ports")
    }

    /// Process-group ids of the running tunnels.
    pub fn tunnel_pids_file(&self) -> PathBuf {
        self.dir.join("tunnel.pids")
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join("portbridge.log")
    }

    /// Captured output of the tunnel client forwarding `port`.
    pub fn tunnel_output(&self, port: u16) -> PathBuf {
        self.dir.join(format!("tunnel-{}.out", port))
    }
}
