//! Channel identity: a (symbol, interval) pair
//!
//! A channel is the unit of multiplexing. Every client subscribed to the same
//! channel shares a single upstream kline stream.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

/// Kline granularities accepted by the upstream feed.
///
/// Tokens are case sensitive: `1m` is one minute, `1M` is one month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    Sec1,
    Min1,
    Min3,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour2,
    Hour4,
    Hour6,
    Hour8,
    Hour12,
    Day1,
    Day3,
    Week1,
    Month1,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Interval::Sec1,
        Interval::Min1,
        Interval::Min3,
        Interval::Min5,
        Interval::Min15,
        Interval::Min30,
        Interval::Hour1,
        Interval::Hour2,
        Interval::Hour4,
        Interval::Hour6,
        Interval::Hour8,
        Interval::Hour12,
        Interval::Day1,
        Interval::Day3,
        Interval::Week1,
        Interval::Month1,
    ];

    /// Wire token, as used in stream names and client parameters
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Sec1 => "1s",
            Interval::Min1 => "1m",
            Interval::Min3 => "3m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Min30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour2 => "2h",
            Interval::Hour4 => "4h",
            Interval::Hour6 => "6h",
            Interval::Hour8 => "8h",
            Interval::Hour12 => "12h",
            Interval::Day1 => "1d",
            Interval::Day3 => "3d",
            Interval::Week1 => "1w",
            Interval::Month1 => "1M",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == token)
            .ok_or_else(|| GatewayError::InvalidChannel(format!("unsupported interval: {}", token)))
    }
}

/// Immutable channel identifier.
///
/// `symbol` is the normalized base asset (e.g. `BTC`); the upstream pair is
/// derived from it with the configured quote asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    symbol: String,
    interval: Interval,
}

impl ChannelKey {
    /// Build a key from an already-normalized symbol.
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Channel name used in logs and metric labels (`market:BTC:1h`)
    pub fn channel_name(&self) -> String {
        format!("market:{}:{}", self.symbol, self.interval)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.interval)
    }
}

/// The set of channels this gateway is willing to serve.
#[derive(Debug, Clone)]
pub struct ChannelCatalog {
    symbols: BTreeSet<String>,
    quote_asset: String,
}

/// Default symbols served when none are configured
pub const DEFAULT_SYMBOLS: &[&str] = &["BTC", "ETH", "BNB", "SOL", "ADA", "XRP", "DOGE", "DOT"];

/// Default quote asset for upstream pairs
pub const DEFAULT_QUOTE_ASSET: &str = "USDT";

impl ChannelCatalog {
    pub fn new<I, S>(symbols: I, quote_asset: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let quote_asset = quote_asset.into().trim().to_uppercase();
        let symbols = symbols
            .into_iter()
            .map(|s| strip_quote(&s.as_ref().trim().to_uppercase(), &quote_asset))
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            symbols,
            quote_asset,
        }
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    /// Normalize a client-supplied symbol: trim, uppercase, strip the quote asset.
    pub fn normalize_symbol(&self, raw: &str) -> String {
        strip_quote(&raw.trim().to_uppercase(), &self.quote_asset)
    }

    /// Validate raw client parameters and produce a key.
    ///
    /// Absent or blank parameters are `MissingParameter`; anything outside the
    /// catalog is `InvalidChannel`.
    pub fn resolve(
        &self,
        symbol: Option<&str>,
        interval: Option<&str>,
    ) -> Result<ChannelKey, GatewayError> {
        let (symbol, interval) = match (non_blank(symbol), non_blank(interval)) {
            (Some(s), Some(i)) => (s, i),
            _ => return Err(GatewayError::MissingParameter),
        };

        let symbol = self.normalize_symbol(symbol);
        if !self.symbols.contains(&symbol) {
            return Err(GatewayError::InvalidChannel(format!(
                "unsupported symbol: {}",
                symbol
            )));
        }
        let interval: Interval = interval.parse()?;

        Ok(ChannelKey::new(symbol, interval))
    }

    /// Upstream trading pair for a key (`BTC` + `USDT` → `BTCUSDT`)
    pub fn upstream_pair(&self, key: &ChannelKey) -> String {
        format!("{}{}", key.symbol(), self.quote_asset)
    }
}

impl Default for ChannelCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_SYMBOLS.iter().copied(), DEFAULT_QUOTE_ASSET)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn strip_quote(symbol: &str, quote: &str) -> String {
    match symbol.strip_suffix(quote) {
        Some(base) if !base.is_empty() => base.to_string(),
        _ => symbol.to_string(),
    }
}
