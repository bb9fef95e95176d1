//! Standalone trace event server
//!
//! Serves the `/events` WebSocket stream until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use trace_event_bus::{BroadcastService, BusConfig, EVENTS_PATH};

#[derive(Debug, Parser)]
#[command(name = "trace-event-server", version, about = "Serve the agent trace event stream over WebSocket")]
struct Cli {
    /// TOML config file (TRACE_BUS_* environment variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, overrides config and environment
    #[arg(short, long)]
    bind: Option<String>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn load_config(cli: &Cli) -> Result<BusConfig> {
    let mut config = BusConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = &cli.bind {
        config.bind_addr = bind.clone();
        config.validate().context("Invalid --bind address")?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    info!(
        bind = %config.bind_addr,
        replay_capacity = config.replay_capacity,
        "starting trace event server"
    );

    let running = BroadcastService::new(config)
        .start()
        .await
        .context("Failed to start event server")?;
    info!("events available at ws://{}{}", running.local_addr(), EVENTS_PATH);

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("interrupt received, shutting down");
    running.shutdown().await;

    Ok(())
}
