//! Binance kline WebSocket session
//!
//! One socket per channel. Binance pings every few minutes and expects a pong;
//! a silent socket is treated as dead after the read timeout.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::binance::messages::parse_kline;
use crate::error::FeedError;
use crate::message::TickEvent;
use crate::metrics;
use crate::traits::{FeedEvent, FeedSession};

pub struct BinanceWebSocket {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    channel: String,
    read_timeout: Duration,
}

impl BinanceWebSocket {
    /// Connect to a single kline stream URL.
    pub async fn connect(
        url: &str,
        channel: String,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, FeedError> {
        info!(url = %url, channel = %channel, "Connecting to Binance WebSocket");

        let (ws, response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| FeedError::Timeout(connect_timeout.as_secs()))??;

        info!(status = ?response.status(), channel = %channel, "Binance WebSocket connected");

        Ok(Self {
            ws,
            channel,
            read_timeout,
        })
    }

    /// Receive the next parsed tick.
    ///
    /// Malformed payloads are logged, counted and skipped.
    pub async fn recv_tick(&mut self) -> Result<TickEvent, FeedError> {
        loop {
            let recv_result = tokio::time::timeout(self.read_timeout, self.ws.next()).await;

            match recv_result {
                Err(_) => {
                    warn!(
                        channel = %self.channel,
                        timeout_secs = self.read_timeout.as_secs(),
                        "Binance WebSocket read timeout"
                    );
                    return Err(FeedError::Timeout(self.read_timeout.as_secs()));
                }
                Ok(Some(Ok(Message::Text(text)))) => match parse_kline(&text) {
                    Ok(tick) => {
                        trace!(channel = %self.channel, msg = %text, "Received kline");
                        return Ok(tick);
                    }
                    Err(e) => {
                        metrics::inc_parse_error(&self.channel);
                        warn!(channel = %self.channel, error = %e, text = %text, "Failed to parse Binance message");
                        continue;
                    }
                },
                Ok(Some(Ok(Message::Ping(data)))) => {
                    trace!(channel = %self.channel, "Received WS ping, sending pong");
                    self.ws.send(Message::Pong(data)).await?;
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    info!(channel = %self.channel, frame = ?frame, "Binance WebSocket closed");
                    return Err(FeedError::Closed);
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Err(FeedError::Closed),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), FeedError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

#[async_trait]
impl FeedSession for BinanceWebSocket {
    async fn recv(&mut self) -> FeedEvent {
        match self.recv_tick().await {
            Ok(tick) => FeedEvent::Tick(tick),
            Err(FeedError::Closed) => FeedEvent::Closed,
            Err(e) => {
                debug!(channel = %self.channel, error = %e, "Binance session failed");
                FeedEvent::Error(e.to_string())
            }
        }
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        BinanceWebSocket::close(self).await
    }
}
