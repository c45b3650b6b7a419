use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use kline_gateway_lib::{
    BinanceConfig, ChannelCatalog, GatewayConfig, RetryPolicy, BINANCE_WS_URL,
};

/// kline-gateway: Binance kline streams → websocket subscribers
#[derive(Parser, Debug)]
#[command(name = "kline-gateway")]
pub struct Config {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:4001")]
    pub listen_addr: SocketAddr,

    /// Upstream kline stream base URL
    #[arg(long, env = "FEED_WS_URL", default_value = BINANCE_WS_URL)]
    pub feed_url: String,

    /// Comma-separated base symbols clients may subscribe to
    #[arg(
        long,
        env = "GATEWAY_SYMBOLS",
        default_value = "BTC,ETH,BNB,SOL,ADA,XRP,DOGE,DOT"
    )]
    pub symbols: String,

    /// Quote asset appended to symbols for upstream pairs
    #[arg(long, env = "QUOTE_ASSET", default_value = "USDT")]
    pub quote_asset: String,

    /// Delay before closing an upstream stream that lost its last subscriber (0 = immediate)
    #[arg(long, env = "TEARDOWN_GRACE_MS", default_value = "2000")]
    pub grace_ms: u64,

    /// Reconnect attempts before a channel is reported unavailable
    #[arg(long, env = "UPSTREAM_MAX_RETRIES", default_value = "5")]
    pub max_retries: u32,

    /// First reconnect delay; doubles per attempt
    #[arg(long, env = "UPSTREAM_BACKOFF_INITIAL_MS", default_value = "500")]
    pub backoff_initial_ms: u64,

    /// Upper bound on the reconnect delay
    #[arg(long, env = "UPSTREAM_BACKOFF_MAX_MS", default_value = "30000")]
    pub backoff_max_ms: u64,

    /// Outbound queue depth per client
    #[arg(long, env = "CLIENT_BUFFER", default_value = "256")]
    pub client_buffer: usize,

    /// Upstream connect timeout in seconds
    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT_SECS", default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Upstream read timeout in seconds
    #[arg(long, env = "UPSTREAM_READ_TIMEOUT_SECS", default_value = "120")]
    pub read_timeout_secs: u64,
}

impl Config {
    pub fn catalog(&self) -> ChannelCatalog {
        ChannelCatalog::new(
            self.symbols.split(',').map(str::trim).filter(|s| !s.is_empty()),
            self.quote_asset.as_str(),
        )
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            grace_period: Duration::from_millis(self.grace_ms),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                initial_backoff: Duration::from_millis(self.backoff_initial_ms),
                max_backoff: Duration::from_millis(self.backoff_max_ms),
            },
            client_buffer: self.client_buffer,
        }
    }

    pub fn binance_config(&self) -> BinanceConfig {
        BinanceConfig {
            base_url: self.feed_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }
}
