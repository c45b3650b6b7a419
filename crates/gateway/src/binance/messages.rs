//! Binance kline stream message types
//!
//! Binance sends prices and volumes as decimal strings; they are converted to
//! `f64` here and rejected if they are not finite.

use serde::Deserialize;

use crate::error::ParseError;
use crate::message::TickEvent;

/// Kline event from `<pair>@kline_<interval>`
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "s", default)]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: Kline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Kline {
    /// Open time (epoch ms)
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "i", default)]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    /// Kline is closed
    #[serde(rename = "x")]
    pub is_final: bool,
}

fn number(field: &'static str, value: &str) -> Result<f64, ParseError> {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidNumber {
            field,
            value: value.to_string(),
        }),
    }
}

impl TryFrom<&Kline> for TickEvent {
    type Error = ParseError;

    fn try_from(k: &Kline) -> Result<Self, Self::Error> {
        Ok(TickEvent {
            timestamp: k.open_time,
            open: number("open", &k.open)?,
            high: number("high", &k.high)?,
            low: number("low", &k.low)?,
            close: number("close", &k.close)?,
            volume: number("volume", &k.volume)?,
            is_final: k.is_final,
        })
    }
}

/// Parse a raw kline payload into a tick.
pub fn parse_kline(text: &str) -> Result<TickEvent, ParseError> {
    let event: KlineEvent = serde_json::from_str(text)?;
    TickEvent::try_from(&event.kline)
}
