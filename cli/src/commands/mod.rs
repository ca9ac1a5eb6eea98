//! CLI command implementations.

pub mod daemon;
pub mod info;
pub mod lifecycle;

use anyhow::{Context, Result};
use portbridge_core::{Error, RuntimeError, Settings, SettingsStore, StatePaths};

/// Printed when a command needs a live daemon.
pub const NOT_RUNNING: &str = "portbridge is not running";

/// Load user settings and resolve the state directory.
pub async fn load_context() -> Result<(Settings, StatePaths)> {
    let store = SettingsStore::new()?;
    let settings = store
        .load()
        .await
        .with_context(|| format!("Failed to load {}", store.path().display()))?;

    let paths = StatePaths::resolve(&settings);
    paths
        .ensure()
        .with_context(|| format!("Failed to create {}", paths.dir().display()))?;
    Ok((settings, paths))
}

/// Remediation for errors whose message does not already include one.
pub fn hint(err: &anyhow::Error) -> Option<&'static str> {
    let runtime = err.chain().find_map(|cause| {
        cause.downcast_ref::<RuntimeError>().or_else(|| match cause.downcast_ref::<Error>() {
            Some(Error::Runtime(runtime)) => Some(runtime),
            _ => None,
        })
    })?;
    runtime.hint()
}
