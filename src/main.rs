//! Buckos service supervisor binary.
//!
//! Run without flags at boot to start the system services, or with
//! `--user` at the start of a user session.

use buckos_warden::{ConfigSource, Invocation, Supervisor, SupervisorConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "warden",
    about = "Buckos service supervisor - boots and supervises services",
    version,
    author
)]
struct Cli {
    /// Run in user-session mode
    #[arg(short, long)]
    user: bool,

    /// Configuration sources to use instead of the defaults (repeatable)
    #[arg(short, long = "config", value_name = "PATH")]
    configs: Vec<PathBuf>,

    /// Where to write the status snapshot requested with SIGUSR1
    #[arg(long, value_name = "PATH")]
    status_file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let invocation = if cli.user {
        Invocation::User
    } else {
        Invocation::System
    };

    let mut config = SupervisorConfig::for_invocation(invocation);
    if !cli.configs.is_empty() {
        config.sources = cli.configs.into_iter().map(ConfigSource::required).collect();
    }
    if let Some(status_file) = cli.status_file {
        config.status_file = status_file;
    }

    info!(
        invocation = ?invocation,
        sources = ?config.sources.iter().map(|s| s.path.display().to_string()).collect::<Vec<_>>(),
        "Buckos service supervisor starting"
    );

    Supervisor::new(config).run().await?;
    Ok(())
}
