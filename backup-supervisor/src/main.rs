//! Backup Supervisor - Main entry point
//!
//! Serves the guest's block exports to the remote backup consumer.

use anyhow::Result;
use backup_supervisor::{
    config::Config,
    daemon::ShutdownCoordinator,
    export::{nbd::NbdConnector, ExportService},
    tunnel::{ConnectDialer, TunnelManager},
    utils,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Tunnel target `host:port` (overrides config)
    #[arg(short, long)]
    target: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };
    if let Some(target) = args.target {
        config.tunnel.target_address = target;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting backup-supervisor v{} (supervisor_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.supervisor.id
    );

    let shutdown = ShutdownCoordinator::new();

    let connector = Arc::new(NbdConnector::new(config.export.nbd_socket.clone()));
    let service = Arc::new(ExportService::new(
        connector,
        config.export.map_batch_size,
        config.export.read_chunk_size,
    ));

    let tunnel = if config.tunnel.target_address.is_empty() {
        tracing::warn!("No tunnel target configured, export is not served");
        None
    } else {
        let dialer = Arc::new(ConnectDialer::from_config(&config.tunnel)?);
        let manager = TunnelManager::new(config.tunnel.clone(), service, Vec::new(), dialer);
        manager.start()?;
        tracing::info!("Tunnel target: {}", config.tunnel.target_address);
        Some(manager)
    };

    shutdown.wait_for_signal().await?;

    if let Some(manager) = tunnel {
        manager.stop().await;
    }
    tracing::info!("Shutdown complete");

    Ok(())
}
