//! Binance kline feed
//!
//! Opens one public WebSocket stream per channel; no authentication needed.

pub mod messages;
pub mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::channel::{ChannelCatalog, ChannelKey};
use crate::error::FeedError;
use crate::traits::{FeedProvider, FeedSession};

pub use messages::{parse_kline, KlineEvent};
pub use websocket::BinanceWebSocket;

/// Binance public stream base URL
pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            base_url: BINANCE_WS_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(120),
        }
    }
}

pub struct BinanceFeed {
    config: BinanceConfig,
    catalog: ChannelCatalog,
}

impl BinanceFeed {
    pub fn new(config: BinanceConfig, catalog: ChannelCatalog) -> Self {
        Self { config, catalog }
    }

    /// Stream URL for a channel: `<base>/<pair>@kline_<interval>`
    pub fn stream_url(&self, key: &ChannelKey) -> Result<Url, FeedError> {
        let raw = format!(
            "{}/{}@kline_{}",
            self.config.base_url.trim_end_matches('/'),
            self.catalog.upstream_pair(key).to_lowercase(),
            key.interval()
        );
        Url::parse(&raw).map_err(|e| FeedError::ConnectionFailed(format!("{}: {}", raw, e)))
    }
}

#[async_trait]
impl FeedProvider for BinanceFeed {
    async fn open(&self, key: &ChannelKey) -> Result<Box<dyn FeedSession>, FeedError> {
        let url = self.stream_url(key)?;
        let ws = BinanceWebSocket::connect(
            url.as_str(),
            key.channel_name(),
            self.config.connect_timeout,
            self.config.read_timeout,
        )
        .await?;
        Ok(Box::new(ws))
    }
}
