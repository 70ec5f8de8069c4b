//! Synod daemon
//!
//! Runs a full node: artifact store, graph shards, cache and the consensus
//! network, plus a small HTTP status surface.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! synod
//!
//! # Start with custom config
//! synod --config /path/to/config.toml
//!
//! # Start with custom data directory
//! synod --data-dir /var/lib/synod
//!
//! # Start with custom status port
//! synod --http-port 8141
//! ```
//!
//! ## HTTP API
//!
//! - `GET /health`  - Health check
//! - `GET /status`  - Per-component status
//! - `GET /history` - Recent voting outcomes

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use synod::{Config, StatusServer, SynodNode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "synod")]
#[command(about = "Consensus-validated distributed knowledge graph node")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(long, env = "SYNOD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP status port
    #[arg(long)]
    http_port: Option<u16>,

    /// Consensus approval threshold override
    #[arg(long)]
    consensus_threshold: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("synod=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::load_or_default(synod::config::default_data_dir().join("config.toml"))?
    };

    // Apply CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(threshold) = args.consensus_threshold {
        config.consensus_threshold = threshold;
    }

    info!(
        data_dir = %config.data_dir.display(),
        http_port = config.http_port,
        partitions = config.partition_count,
        "Starting synod"
    );

    // Save default config next to the data if it does not exist yet
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let node = SynodNode::start(config.clone()).await?;

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let server = Arc::new(StatusServer::new(Arc::clone(&node), http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Endpoints:");
    info!("  GET /health  - Health check");
    info!("  GET /status  - Per-component status");
    info!("  GET /history - Recent voting outcomes");
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    node.shutdown();

    if let Ok(status) = node.status() {
        info!(
            nodes = status.graph.node_count,
            chain_height = status.consensus.chain_height,
            "Final status"
        );
    }

    Ok(())
}
