//! Prometheus metrics for the gateway
//!
//! Channel-labelled series use the channel name (`market:BTC:1h`).

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder, IntCounterVec,
    IntGauge, IntGaugeVec, TextEncoder,
};

const LABEL_CHANNEL: &str = "channel";
const LABEL_REASON: &str = "reason";

/// Connected websocket clients
static CLIENTS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kline_gateway_clients_connected",
        "Number of connected websocket clients"
    )
    .expect("Failed to register clients_connected metric")
});

/// Upstream connection status per channel (1 = open, 0 = not open)
static UPSTREAM_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "kline_gateway_upstream_connected",
        "Upstream connection status per channel (1=open, 0=not open)",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register upstream_connected metric")
});

static TICKS_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kline_gateway_ticks_received_total",
        "Ticks received from upstream per channel",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register ticks_received metric")
});

/// Frames enqueued to clients (one per subscriber per tick)
static TICKS_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kline_gateway_ticks_delivered_total",
        "Tick frames enqueued to subscribers per channel",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register ticks_delivered metric")
});

static CLIENT_DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kline_gateway_client_drops_total",
        "Clients disconnected by the gateway, by reason",
        &[LABEL_REASON]
    )
    .expect("Failed to register client_drops metric")
});

static PARSE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kline_gateway_parse_errors_total",
        "Upstream payloads that failed to parse",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register parse_errors metric")
});

static UPSTREAM_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kline_gateway_upstream_reconnects_total",
        "Upstream reconnect attempts per channel",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register upstream_reconnects metric")
});

static CHANNELS_DEGRADED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kline_gateway_channels_degraded_total",
        "Channels marked unavailable after exhausting upstream retries",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register channels_degraded metric")
});

pub fn inc_clients_connected() {
    CLIENTS_CONNECTED.inc();
}

pub fn dec_clients_connected() {
    CLIENTS_CONNECTED.dec();
}

pub fn set_upstream_connected(channel: &str, connected: bool) {
    UPSTREAM_CONNECTED
        .with_label_values(&[channel])
        .set(i64::from(connected));
}

pub fn inc_ticks_received(channel: &str) {
    TICKS_RECEIVED.with_label_values(&[channel]).inc();
}

pub fn inc_ticks_delivered(channel: &str, count: usize) {
    TICKS_DELIVERED
        .with_label_values(&[channel])
        .inc_by(count as u64);
}

/// Record a client dropped by the gateway (`slow`, `closed`, `degraded`, `shutdown`)
pub fn inc_client_drop(reason: &str) {
    CLIENT_DROPS.with_label_values(&[reason]).inc();
}

pub fn inc_parse_error(channel: &str) {
    PARSE_ERRORS.with_label_values(&[channel]).inc();
}

pub fn inc_upstream_reconnects(channel: &str) {
    UPSTREAM_RECONNECTS.with_label_values(&[channel]).inc();
}

pub fn inc_channel_degraded(channel: &str) {
    CHANNELS_DEGRADED.with_label_values(&[channel]).inc();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
