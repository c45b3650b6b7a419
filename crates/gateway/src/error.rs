use thiserror::Error;

use crate::client::ClientId;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Missing symbol or interval parameter")]
    MissingParameter,
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
    #[error("upstream unavailable for {channel}: {reason}")]
    UpstreamUnavailable { channel: String, reason: String },
    #[error("write to client {0} failed")]
    ClientWriteFailure(ClientId),
}

impl GatewayError {
    /// Short code sent to clients in `{"error": ...}` payloads
    pub fn client_code(&self) -> &'static str {
        match self {
            GatewayError::MissingParameter => "Missing symbol or interval parameter",
            GatewayError::InvalidChannel(_) => "InvalidChannel",
            GatewayError::UpstreamUnavailable { .. } => "UpstreamUnavailable",
            GatewayError::ClientWriteFailure(_) => "ClientWriteFailure",
        }
    }
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timeout after {0} seconds")]
    Timeout(u64),
    #[error("connection closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid number in field {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },
}
