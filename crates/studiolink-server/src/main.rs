//! `studiolink-discovery-server`: run a discovery server.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use studiolink_server::DiscoveryServer;
use studiolink_types::load_config;
use tracing::info;

/// Peer listing and signaling relay for studiolink.
#[derive(Parser)]
#[command(name = "studiolink-discovery-server", version)]
struct Cli {
    /// Path to config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `[server] listen_addr`.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref());
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    let (server, handle) = DiscoveryServer::start(&config.server).await?;
    info!(url = %server.url(), "Ready");

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    server.shutdown();
    handle.await?;
    Ok(())
}
