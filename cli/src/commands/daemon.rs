//! Foreground daemon: owns the reconciler until the event feed breaks or a
//! termination signal arrives.

use anyhow::{bail, Result};
use portbridge_core::config::{MachineEnv, Settings, StatePaths};
use portbridge_core::{
    DockerRuntime, PidFile, Reconciler, SshOptions, SshTunnelController, StateStore,
    TcpPortProbe, TunnelRegistry,
};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{info, warn};

use super::load_context;

pub async fn run() -> Result<()> {
    let (settings, paths) = load_context().await?;

    let env = MachineEnv::from_env()?;
    env.validate_credentials()?;

    let pid = std::process::id();
    let pid_file = PidFile::new(&paths);
    if let Some(running) = pid_file.running_pid()? {
        if running != pid {
            bail!("portbridge is already running (pid {})", running);
        }
    }
    pid_file.write(pid)?;
    info!(pid, machine = %env.machine_name, state_dir = %paths.dir().display(), "Daemon starting");

    let result = serve(&env, &settings, &paths).await;

    if let Err(e) = pid_file.remove_if_owned(pid) {
        warn!(error = %e, "Failed to remove PID file");
    }
    match &result {
        Ok(()) => info!("Daemon stopped"),
        Err(e) => warn!(error = %format!("{:#}", e), "Daemon stopped"),
    }
    result
}

async fn serve(env: &MachineEnv, settings: &Settings, paths: &StatePaths) -> Result<()> {
    let runtime = DockerRuntime::connect(env).await?;

    let controller = SshTunnelController::new(SshOptions::new(env, settings, paths));
    let probe = TcpPortProbe::with_timeout(settings.probe_timeout());
    let registry = TunnelRegistry::new(controller, probe, StateStore::new(paths));
    let mut reconciler = Reconciler::new(runtime, registry);

    let outcome = tokio::select! {
        result = reconciler.run() => result.map_err(anyhow::Error::from),
        result = shutdown_signal() => {
            info!("Shutdown signal received");
            result.map_err(anyhow::Error::from)
        }
    };

    reconciler.shutdown();
    outcome
}

/// Resolves on SIGINT, SIGTERM or SIGHUP.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = unix_signal(SignalKind::terminate())?;
    let mut hangup = unix_signal(SignalKind::hangup())?;

    tokio::select! {
        result = signal::ctrl_c() => result?,
        _ = terminate.recv() => {},
        _ = hangup.recv() => {},
    }
    Ok(())
}
