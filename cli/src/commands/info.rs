//! ls, log and version.

use std::fs;
use std::io;

use anyhow::{bail, Context, Result};
use portbridge_core::tunnel::read_port_list;
use portbridge_core::PidFile;

use super::{load_context, NOT_RUNNING};

pub async fn ls() -> Result<()> {
    let (_, paths) = load_context().await?;

    if PidFile::new(&paths).running_pid()?.is_none() {
        bail!(NOT_RUNNING);
    }

    match read_port_list(&paths.ports_file())? {
        Some(entries) if !entries.is_empty() => {
            for entry in entries {
                println!("{}", entry);
            }
        }
        _ => println!("None"),
    }
    Ok(())
}

pub async fn log() -> Result<()> {
    let (_, paths) = load_context().await?;
    let path = paths.log_file();

    match fs::read_to_string(&path) {
        Ok(content) => {
            print!("{}", content);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            bail!("No log yet at {}", path.display())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub fn version() {
    println!("portbridge {}", env!("CARGO_PKG_VERSION"));
}
