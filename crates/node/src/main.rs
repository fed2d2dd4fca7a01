//! # DCLT Node Entry Point
//!
//! Startup flow:
//! 1. Parse CLI arguments
//! 2. Initialize tracing (filter from `RUST_LOG`)
//! 3. Load config (TOML file or defaults), apply CLI overrides
//! 4. Start the tracker node
//! 5. Run until SIGINT, then stop cleanly

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dclt_common::{config, SystemClock, TrackerConfig};
use dclt_proto::MachineLocation;
use dclt_node::{Cli, TrackerNode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut cfg = match &cli.config {
        Some(path) => config::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TrackerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        cfg.bind_addr = bind;
    }

    let advertised = cli.advertise.as_deref().unwrap_or(&cfg.bind_addr);
    let advertised = MachineLocation::parse(advertised)
        .with_context(|| format!("bad advertised location {advertised}"))?;

    info!(location = %advertised, bind = %cfg.bind_addr, "starting tracker node");
    let mut node = TrackerNode::new(cfg, advertised, Arc::new(SystemClock));
    node.start().await.context("starting tracker node")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    node.stop().await;
    Ok(())
}
