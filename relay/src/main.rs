use std::path::PathBuf;

use anyhow::Result;
use backhaul_relay::{app, config::BrokerConfig, AppState};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backhaul-relay")]
#[command(version)]
#[command(about = "Public relay for private HTTP servers behind NAT", long_about = None)]
struct Cli {
    /// Path to the YAML config file (default: ./config.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening port, overrides config and SERVICE_PORT
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "backhaul_relay=debug"
    } else {
        "backhaul_relay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = load_config(&cli)?;
    let addr = config.listen_addr()?;
    info!(
        tunnel_path = %config.tunnel.path,
        identifier_header = %config.tunnel.identifier_header,
        "Backhaul Relay on {}",
        addr
    );

    let state = AppState::new(config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<BrokerConfig> {
    let path = cli.config.clone().or_else(BrokerConfig::find_config);
    let mut config = match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            BrokerConfig::load(&path)?
        }
        None => BrokerConfig::default(),
    };

    config.apply_env()?;
    if let Some(port) = cli.port {
        config.service.port = port;
    }
    config.validate()?;
    Ok(config)
}
