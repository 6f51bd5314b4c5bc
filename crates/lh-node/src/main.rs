//! # lhnode
//!
//! Runs a storage, insert or select node until Ctrl+C.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lh_node::{Args, NodeConfig};

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "lh_node=info,lh_store=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match NodeConfig::load(args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "starting {:?} node: insert={} select={}",
        config.role(),
        config.insert_enabled,
        config.select_enabled
    );
    let node = match lh_node::start(config).await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("cannot start node: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for shutdown signal: {}", e);
    }
    tracing::info!("received shutdown signal");
    node.stop().await;
}
