use anyhow::Result;
use clap::Parser;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod proxy;
mod tunnel;

use tunnel::AgentConfig;

#[derive(Parser)]
#[command(name = "backhaul")]
#[command(version)]
#[command(about = "Expose a private HTTP service through a Backhaul relay", long_about = None)]
struct Cli {
    /// Relay tunnel URL
    #[arg(short, long, env = "BACKHAUL_RELAY", default_value = "ws://localhost:8080/ws")]
    relay: String,

    /// Private server identifier to announce
    #[arg(short, long, env = "BACKHAUL_ID")]
    id: String,

    /// Base URL of the local HTTP service
    #[arg(short, long, default_value = "http://127.0.0.1:3000")]
    target: String,

    /// Seconds to wait before reconnecting after a disconnect
    #[arg(long, default_value_t = 5)]
    reconnect_delay_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "backhaul=debug" } else { "backhaul=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if cli.id.trim().is_empty() {
        anyhow::bail!("--id cannot be empty");
    }

    let config = AgentConfig {
        relay: cli.relay,
        identifier: cli.id,
        target: cli.target,
    };
    let client = proxy::build_client()?;
    let delay = Duration::from_secs(cli.reconnect_delay_secs);

    let agent = async {
        loop {
            match tunnel::run(&config, client.clone()).await {
                Ok(()) => info!("Tunnel closed, reconnecting in {}s...", delay.as_secs()),
                Err(e) => error!("Tunnel error: {}. Reconnecting in {}s...", e, delay.as_secs()),
            }
            tokio::time::sleep(delay).await;
        }
    };

    tokio::select! {
        _ = agent => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    Ok(())
}
