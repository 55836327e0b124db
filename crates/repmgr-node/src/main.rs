//! repmgr node - one replication site
//!
//! Keeps connections to the configured remote sites, accepts connections
//! from the rest of the group and acks replication traffic it receives.

use clap::Parser;
use repmgr_core::RepMgr;
use repmgr_node::handler::{AckingHandler, LoggingElection, forward_acks};
use repmgr_node::{LogFormat, NodeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// repmgr node CLI arguments
#[derive(Parser, Debug)]
#[command(name = "repmgr-node")]
#[command(about = "Replication group-communication node", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = NodeConfig::load(args.config.as_deref())?;

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "repmgr=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "repmgr=info".into())
    };
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("repmgr-worker")
        .enable_all()
        .build()?;

    rt.block_on(async_main(config))
}

async fn async_main(config: NodeConfig) -> anyhow::Result<()> {
    let (handler, acks) = AckingHandler::new();
    let mgr = RepMgr::start(config.repmgr, Arc::new(handler), Arc::new(LoggingElection)).await?;
    info!(
        "Site {} up, {} remote sites configured",
        mgr.identity(),
        mgr.sites().len()
    );

    let ack_task = tokio::spawn(forward_acks(mgr.clone(), acks));

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    mgr.shutdown().await;
    ack_task.abort();

    let stats = mgr.stats();
    info!(
        "Connections: {} accepted, {} initiated, {} lost; messages: {} sent, {} received, {} acks",
        stats.connections_accepted,
        stats.connections_initiated,
        stats.connections_busted,
        stats.messages_sent,
        stats.messages_received,
        stats.acks_received
    );
    Ok(())
}
