use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quorumd::config::Config;
use quorumd::raft::RaftNode;
use quorumd::server;
use quorumd::state_machine::LogApplier;
use quorumd::transport::PeerClient;

#[derive(Debug, Parser)]
#[command(name = "quorumd", version, about = "Replicated-log coordination service")]
struct Args {
    /// Node identifier, unique within the cluster
    #[arg(long)]
    id: Option<String>,

    /// Listen address, e.g. 0.0.0.0:5000
    #[arg(long)]
    listen: Option<String>,

    /// Comma-separated peer base URLs, e.g. http://10.0.0.2:5000
    #[arg(long, value_delimiter = ',')]
    peers: Option<Vec<String>>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quorumd=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading configuration from {path}"))?
        }
        None => Config::default(),
    };
    if let Some(id) = args.id {
        config.node_id = id;
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(peers) = args.peers {
        config.peers = peers;
    }
    config.validate()?;

    let transport = PeerClient::new(config.timing.rpc_timeout())?;
    let node = RaftNode::new(config.clone(), transport, Arc::new(LogApplier));

    tokio::spawn(Arc::clone(&node).run());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(
        id = %node.id(),
        addr = %config.listen_addr,
        peers = config.peers.len(),
        "node listening"
    );

    axum::serve(listener, server::router(node))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
