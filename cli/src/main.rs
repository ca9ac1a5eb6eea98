//! PortBridge CLI - Forward docker-machine container ports to localhost
//!
//! Starts and stops the background daemon that keeps one `ssh -L` tunnel
//! per published container port, and inspects its state.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portbridge")]
#[command(author, version, about = "Forward docker-machine container ports to localhost")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the background
    Start,

    /// Stop the daemon and every tunnel it opened
    Stop,

    /// Stop the daemon if it is running, then start it again
    Restart,

    /// Print whether the daemon is running
    Status,

    /// List the forwarded ports
    Ls,

    /// Print the daemon log
    Log,

    /// Print the version
    Version,

    /// Run the daemon in the foreground
    #[command(hide = true)]
    Daemon,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon => init_logging("info", false),
        _ => init_logging("warn", true),
    }

    let result = match cli.command {
        Commands::Start => commands::lifecycle::start().await,
        Commands::Stop => commands::lifecycle::stop().await,
        Commands::Restart => commands::lifecycle::restart().await,
        Commands::Status => commands::lifecycle::status().await,
        Commands::Ls => commands::info::ls().await,
        Commands::Log => commands::info::log().await,
        Commands::Version => {
            commands::info::version();
            Ok(())
        }
        Commands::Daemon => commands::daemon::run().await,
    };

    if let Err(e) = result {
        eprintln!("{:#}", e);
        if let Some(hint) = commands::hint(&e) {
            eprintln!("{}", hint);
        }
        std::process::exit(1);
    }
}

/// Log to stderr. `RUST_LOG` overrides `default_directive`.
fn init_logging(default_directive: &str, ansi: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .init();
}
