//! CLI definitions for the tracker node binary.

use clap::Parser;

/// DCLT Node — ephemeral distributed content tracker.
///
/// Serves the `Cache.ContentTracker` RPC endpoint, heartbeats into the
/// cluster state and runs the liveness and retention sweeps.
#[derive(Debug, Parser)]
#[command(
    name = "dclt-node",
    version,
    about = "DCLT Node — ephemeral distributed content tracker"
)]
pub struct Cli {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Override the RPC bind address from the config, e.g. "0.0.0.0:7070".
    #[arg(long)]
    pub bind: Option<String>,

    /// Location this machine advertises to the cluster
    /// (host:port as peers can reach it). Defaults to the bind address.
    #[arg(long)]
    pub advertise: Option<String>,
}
