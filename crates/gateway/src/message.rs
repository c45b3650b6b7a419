//! Wire payloads exchanged with subscribed clients

use serde::{Deserialize, Serialize};

/// One kline update, fanned out verbatim to every subscriber of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickEvent {
    /// Kline open time (epoch milliseconds)
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// True once the kline is closed and will not change again
    pub is_final: bool,
}

/// Messages a connected client may send after the handshake
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientRequest {
    /// Move this client to another channel
    Subscribe {
        symbol: Option<String>,
        interval: Option<String>,
    },
    Ping,
}

/// Control payloads sent to clients (everything that is not a tick)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerNotice {
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    Event {
        #[serde(rename = "type")]
        kind: &'static str,
        channel: String,
    },
    Pong {
        #[serde(rename = "type")]
        kind: &'static str,
    },
}

impl ServerNotice {
    pub fn error(code: impl Into<String>) -> Self {
        ServerNotice::Error {
            error: code.into(),
            channel: None,
        }
    }

    pub fn channel_error(code: impl Into<String>, channel: impl Into<String>) -> Self {
        ServerNotice::Error {
            error: code.into(),
            channel: Some(channel.into()),
        }
    }

    pub fn subscribed(channel: impl Into<String>) -> Self {
        ServerNotice::Event {
            kind: "subscribed",
            channel: channel.into(),
        }
    }

    pub fn pong() -> Self {
        ServerNotice::Pong { kind: "pong" }
    }

    pub fn to_json(&self) -> String {
        // Plain structs of strings cannot fail to serialize
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"internal"}"#.to_string())
    }
}
