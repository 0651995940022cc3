use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use p2p_dashboard::config::AppConfig;
use p2p_dashboard::dashboard::{self, AppState};
use p2p_dashboard::monitoring::logger;
use p2p_dashboard::poller;

#[derive(Debug, Parser)]
#[command(name = "p2p-dashboard", about = "Binance P2P market dashboard")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen port, overriding config and `PORT`.
    #[arg(long, short)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, secrets) = AppConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    logger::init_logging(&config.monitoring)?;

    tracing::info!(
        port = config.server.port,
        asset = config.default_asset(),
        fiat = %config.market.fiat_currency,
        interval_ms = config.market.update_interval_ms,
        "P2P dashboard starting"
    );

    let state = AppState::new(config, secrets)?;
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut server = dashboard::spawn_dashboard(state.clone(), stop_rx.clone());
    let poller = poller::spawn_poller(state, stop_rx);

    // A bind failure ends the server task before any signal arrives
    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutdown requested");
            None
        }
        finished = &mut server => Some(finished),
    };

    let _ = stop_tx.send(true);
    poller.await.context("Poller task panicked")?;

    let server_result = match early_exit {
        Some(finished) => finished,
        None => server.await,
    };
    server_result.context("Dashboard task panicked")??;

    tracing::info!("P2P dashboard stopped");
    Ok(())
}
