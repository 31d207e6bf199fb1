//! Sleepy Daemon - host agent for the Sleepy management server
//!
//! Keeps one persistent control connection to the server and answers it:
//! - Inventory on request (memory, software, processes, disks, ZFS, containers)
//! - Rate-per-second stats computed from cumulative counters
//! - Live container log streaming, database backups, SMB config rebuilds
//! - Self-update when the server requires another version

mod config;
mod database;
mod dispatcher;
mod error;
mod execution;
mod lifecycle;
mod logs;
mod metrics;
mod protocol;
mod resources;
mod smb;
mod snapshot;
mod tasks;
mod transport;
mod updater;
mod upload;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use config::Settings;
use lifecycle::{Agent, Exit, VERSION};
use metrics::SystemProbe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use transport::WsConnector;
use updater::ArchiveUpdater;

#[derive(Debug, Parser)]
#[command(name = "sleepy-daemon", version, about = "Sleepy host agent")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "sleepy_daemon=debug"
    } else {
        "sleepy_daemon=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!("Sleepy Daemon v{} starting...", VERSION);

    let settings = Settings::load(cli.config)
        .await
        .context("Failed to load configuration")?;
    info!("Loaded config from {}", settings.config_path.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
    });

    let connector = WsConnector::new(settings.config.socket_url());
    let updater = ArchiveUpdater::new(settings.clone());
    let agent = Agent::new(
        settings,
        Arc::new(SystemProbe),
        Box::new(connector),
        Box::new(updater),
        shutdown_rx,
    );

    match agent.run().await {
        Exit::Shutdown => info!("Closed the daemon"),
        Exit::Rejected => info!("Daemon stopped, token rejected"),
        Exit::Updated => info!("Handed over to the updated daemon"),
    }
    Ok(())
}
