mod config;
mod shutdown;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kline_gateway_lib::{run_server, BinanceFeed, Gateway, ServerState};
use tracing::info;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kline_gateway=info,kline_gateway_lib=info".into()),
        )
        .json()
        .init();

    let config = Config::parse();
    let catalog = config.catalog();
    if catalog.symbols().next().is_none() {
        anyhow::bail!("no symbols configured");
    }

    info!(
        listen_addr = %config.listen_addr,
        feed_url = %config.feed_url,
        symbols = ?catalog.symbols().collect::<Vec<_>>(),
        quote_asset = %catalog.quote_asset(),
        grace_ms = config.grace_ms,
        max_retries = config.max_retries,
        "kline-gateway starting"
    );

    let feed = BinanceFeed::new(config.binance_config(), catalog.clone());
    let gateway = Gateway::new(catalog, Arc::new(feed), config.gateway_config());
    let state = ServerState::new("binance", Arc::clone(&gateway));

    run_server(
        config.listen_addr,
        state,
        shutdown::wait_for_shutdown(Arc::clone(&gateway)),
    )
    .await
    .with_context(|| format!("server on {} failed", config.listen_addr))?;

    // No-op if the signal path already ran
    gateway.shutdown().await;
    info!("kline-gateway stopped");
    Ok(())
}
