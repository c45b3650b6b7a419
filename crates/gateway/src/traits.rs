use async_trait::async_trait;

use crate::channel::ChannelKey;
use crate::error::FeedError;
use crate::message::TickEvent;

/// Event pulled from an open upstream session
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(TickEvent),
    /// Upstream closed the stream
    Closed,
    /// Transport-level failure; the session is unusable afterwards
    Error(String),
}

/// Upstream feed provider (Binance, mocks in tests, ...)
#[async_trait]
pub trait FeedProvider: Send + Sync + 'static {
    /// Open a kline stream for `key`. Returning `Ok` means the stream is open.
    async fn open(&self, key: &ChannelKey) -> Result<Box<dyn FeedSession>, FeedError>;
}

/// One open upstream stream.
#[async_trait]
pub trait FeedSession: Send {
    /// Next event. Malformed payloads are dropped inside the session and never
    /// surface here. After `Closed` or `Error` the session must not be polled.
    async fn recv(&mut self) -> FeedEvent;

    /// Close the stream
    async fn close(&mut self) -> Result<(), FeedError>;
}
