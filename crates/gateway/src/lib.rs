//! kline-gateway: fan-out of upstream kline streams to websocket clients
//!
//! Clients subscribe to a `(symbol, interval)` channel. Each channel with at
//! least one subscriber is backed by exactly one upstream stream, and every
//! tick from that stream is broadcast to the channel's subscribers.

pub mod binance;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod test_helpers;
pub mod traits;
pub mod upstream;

pub use binance::{BinanceConfig, BinanceFeed, BINANCE_WS_URL};
pub use channel::{ChannelCatalog, ChannelKey, Interval};
pub use client::{ClientHandle, ClientId};
pub use config::GatewayConfig;
pub use error::{FeedError, GatewayError, ParseError};
pub use gateway::{Gateway, GatewayStats};
pub use message::{ClientRequest, ServerNotice, TickEvent};
pub use registry::SubscriptionRegistry;
pub use server::{create_router, run_server, serve, ServerState};
pub use traits::{FeedEvent, FeedProvider, FeedSession};
pub use upstream::{ConnectionState, RetryPolicy, UpstreamManager};
