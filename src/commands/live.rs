//! Live trading command

use anyhow::{Context, Result};
use martingale_sniper::live::{
    notifier, BinanceFeed, BinanceFuturesExecutor, LiveTrader, OrderExecutor, PaperExecutor,
};
use martingale_sniper::state_manager::create_state_store;
use martingale_sniper::Config;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub fn run(
    config_path: String,
    paper: bool,
    live: bool,
    interval: Option<u64>,
    state_dir: Option<String>,
    once: bool,
) -> Result<()> {
    if paper == live {
        anyhow::bail!("Specify exactly one of --paper or --live");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run_async(config_path, live, interval, state_dir, once))
}

async fn run_async(
    config_path: String,
    live: bool,
    interval: Option<u64>,
    state_dir: Option<String>,
    once: bool,
) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);
    if let Some(secs) = interval {
        config.live.poll_interval_secs = secs;
    }
    if let Some(dir) = state_dir {
        config.live.state_dir = dir;
    }

    let mode = if live { "LIVE" } else { "PAPER" };
    info!("Mode: {} trading", mode);
    info!("Symbols: {:?}", config.trading.symbols);
    info!("Poll interval: {}s", config.live.poll_interval_secs);

    let executor: Box<dyn OrderExecutor> = if live {
        let executor = BinanceFuturesExecutor::new(&config.exchange)?;
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 5 seconds to abort...");
        tokio::time::sleep(Duration::from_secs(5)).await;
        Box::new(executor)
    } else {
        Box::new(PaperExecutor::new())
    };

    let feed = BinanceFeed::new(
        config.exchange.base_url.clone(),
        config.trading.timeframe.clone(),
        Duration::from_secs(config.exchange.request_timeout_secs),
    )?;
    let notifier = notifier::from_config(config.live.webhook_url.as_deref());
    let store = create_state_store(&config.live.state_dir)?;
    info!("State directory: {}", config.live.state_dir);

    let mut trader = LiveTrader::new(&config, Box::new(feed), executor, notifier, store, mode)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl+C received - initiating graceful shutdown");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => error!("Failed to listen for shutdown signal: {}", err),
        }
    });

    trader.run(shutdown_rx, once).await?;
    info!("Shutdown complete");
    Ok(())
}
