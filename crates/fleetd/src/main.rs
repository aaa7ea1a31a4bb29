//! Fleet Daemon - simulated fleet remediation
//!
//! Samples host telemetry across clusters, routes anomalies to fixer agents
//! and applies remediations approved by the gatekeeper.

use anyhow::Result;
use clap::Parser;
use fleetd::config::Config;
use fleetd::daemon::{shutdown_on, Fleet};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Fleet remediation daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to /etc/fleetd/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many ticks instead of running until interrupted
    #[arg(long)]
    ticks: Option<u64>,

    /// Print final gatekeeper statistics as JSON
    #[arg(long)]
    json: bool,

    /// Print final gatekeeper counters in Prometheus text format
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("[BOOT] Fleet daemon v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::load(cli.config.as_deref())?;
    let mut fleet = Fleet::build(&config)?;

    let shutdown_rx = shutdown_on(tokio::signal::ctrl_c());

    let stats = fleet.run(shutdown_rx, cli.ticks).await;
    info!("Fleet daemon stopped ({} proposals arbitrated)", stats.total());

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    if cli.metrics {
        print!("{}", fleet.gatekeeper().export_metrics()?);
    }
    Ok(())
}
