//! Peerbloom daemon
//!
//! Runs a standalone network node until Ctrl+C.

use clap::Parser;
use peerbloom::network::{NetworkConfig, Node, NullHandler};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "peerbloom")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer network node", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for the peer address store
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Bootstrap node endpoint
    #[arg(short, long)]
    bootstrap: Option<SocketAddr>,

    /// Peers to keep connected (comma-separated)
    #[arg(long)]
    peers: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NetworkConfig::from_file(path)?,
        None => NetworkConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(bootstrap) = cli.bootstrap {
        config.bootstrap_endpoint = Some(bootstrap);
    }
    if let Some(peers) = cli.peers {
        for peer in peers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            config.static_peers.push(peer.parse()?);
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let node = Node::new(config, Arc::new(NullHandler))?;
        let addr = node.start().await?;
        println!("Node {:016x} listening on {}", node.node_id(), addr);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down node...");
                node.shutdown().await;
            }
            _ = node.wait() => {}
        }

        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    })?;

    Ok(())
}
