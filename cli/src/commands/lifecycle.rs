//! start, stop, restart and status.

use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use portbridge_core::daemon::{self, STOP_TIMEOUT};
use portbridge_core::{MachineEnv, PidFile, StatePaths};

use super::{load_context, NOT_RUNNING};

/// How long a freshly spawned daemon must survive before `start` reports success.
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Lines of the log shown when the daemon dies during startup.
const LOG_TAIL_LINES: usize = 20;

pub async fn start() -> Result<()> {
    let (_, paths) = load_context().await?;

    if let Some(pid) = PidFile::new(&paths).running_pid()? {
        bail!("portbridge is already running (pid {})", pid);
    }

    // Configuration errors are reported here rather than in the log.
    let env = MachineEnv::from_env()?;
    env.validate_credentials()?;

    let pid = spawn_daemon(&paths).await?;
    println!(
        "portbridge started (pid {}), forwarding ports from {} ({})",
        pid, env.machine_name, env.host_ip
    );
    Ok(())
}

pub async fn stop() -> Result<()> {
    let (_, paths) = load_context().await?;

    match daemon::stop(&paths, STOP_TIMEOUT)? {
        Some(pid) => {
            println!("portbridge stopped (pid {})", pid);
            Ok(())
        }
        None => bail!(NOT_RUNNING),
    }
}

pub async fn restart() -> Result<()> {
    let (_, paths) = load_context().await?;

    if let Some(pid) = daemon::stop(&paths, STOP_TIMEOUT)? {
        println!("portbridge stopped (pid {})", pid);
    }
    start().await
}

pub async fn status() -> Result<()> {
    let (_, paths) = load_context().await?;

    match PidFile::new(&paths).running_pid()? {
        Some(_) => println!("running"),
        None => println!("stopped"),
    }
    Ok(())
}

/// Launch `portbridge daemon` detached from this terminal, logging to the state dir.
async fn spawn_daemon(paths: &StatePaths) -> Result<u32> {
    let exe = std::env::current_exe().context("Cannot locate the portbridge executable")?;
    let log_path = paths.log_file();
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;
    let log_err = log.try_clone()?;

    let mut child = Command::new(exe)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .process_group(0)
        .spawn()
        .context("Failed to launch the daemon")?;
    let pid = child.id();

    tokio::time::sleep(STARTUP_GRACE).await;

    if let Some(status) = child.try_wait()? {
        let tail = log_tail(&fs::read_to_string(&log_path).unwrap_or_default(), LOG_TAIL_LINES);
        if !tail.is_empty() {
            eprintln!("{}", tail);
        }
        bail!("portbridge exited during startup ({})", status);
    }

    Ok(pid)
}

fn log_tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
