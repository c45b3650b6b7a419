//! Gateway behavior tests against a mock upstream feed.
//!
//! Covers the channel accounting invariants, broadcast ordering and
//! isolation, grace-window teardown and reconnect decisions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use kline_gateway_lib::test_helpers::*;
use kline_gateway_lib::{
    ChannelCatalog, ChannelKey, ClientHandle, FeedEvent, Gateway, GatewayConfig, GatewayError,
    GatewayStats, Interval, TickEvent,
};
use tokio::sync::mpsc;

type Rx = mpsc::Receiver<Arc<str>>;

fn build(config: GatewayConfig) -> (Arc<Gateway>, MockFeed) {
    let feed = MockFeed::new();
    let gateway = Gateway::new(ChannelCatalog::default(), Arc::new(feed.clone()), config);
    (gateway, feed)
}

fn no_grace() -> GatewayConfig {
    GatewayConfig::default().with_grace_period(Duration::ZERO)
}

fn connect(gateway: &Gateway, symbol: &str, interval: &str) -> (Arc<ClientHandle>, Rx) {
    let (client, rx) = gateway.new_client();
    gateway
        .on_client_connect(&client, Some(symbol), Some(interval))
        .expect("valid channel");
    (client, rx)
}

fn btc_1h() -> ChannelKey {
    ChannelKey::new("BTC", Interval::Hour1)
}

fn decode(frame: &str) -> TickEvent {
    serde_json::from_str(frame).expect("tick payload")
}

// =============================================================================
// Channel accounting
// =============================================================================

#[tokio::test]
async fn test_random_connect_disconnect_sequence_keeps_counts_consistent() {
    let (gateway, feed) = build(no_grace());
    let channels = [
        ("BTC", "1h"),
        ("ETH", "1h"),
        ("BTC", "5m"),
        ("SOL", "1d"),
    ];

    let mut live: Vec<(Arc<ClientHandle>, Rx, usize)> = Vec::new();
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    for _ in 0..400 {
        let roll = next();
        if live.is_empty() || roll % 3 != 0 {
            let idx = (next() % channels.len() as u64) as usize;
            let (symbol, interval) = channels[idx];
            let (client, rx) = connect(&gateway, symbol, interval);
            live.push((client, rx, idx));
        } else {
            let victim = (next() % live.len() as u64) as usize;
            let (client, _rx, _) = live.swap_remove(victim);
            gateway.on_client_disconnect(client.id());
        }

        let distinct: HashSet<usize> = live.iter().map(|(_, _, idx)| *idx).collect();
        let stats = gateway.stats();
        assert_eq!(stats.active_channels, distinct.len());
        assert_eq!(stats.total_clients, live.len());
        assert_eq!(gateway.upstream_connection_count(), distinct.len());
    }

    let expected = live
        .iter()
        .map(|(_, _, idx)| *idx)
        .collect::<HashSet<_>>()
        .len();
    assert!(wait_until(|| gateway.stats().upstream_connections == expected).await);
    assert!(wait_until(|| feed.live_count() == expected).await);
}

#[tokio::test]
async fn test_subscribing_twice_is_idempotent() {
    let (gateway, feed) = build(GatewayConfig::default());
    let (client, _rx) = connect(&gateway, "BTC", "1h");

    gateway
        .on_client_connect(&client, Some("BTC"), Some("1h"))
        .unwrap();

    assert!(wait_until(|| feed.is_live(&btc_1h())).await);
    assert_eq!(gateway.subscriber_count(&btc_1h()), 1);
    assert_eq!(gateway.stats().total_clients, 1);
    assert_eq!(feed.open_count(&btc_1h()), 1);
}

#[tokio::test]
async fn test_move_empties_source_and_closes_it_once() {
    let (gateway, feed) = build(no_grace());
    let eth = ChannelKey::new("ETH", Interval::Hour1);
    let (a, _rx_a) = connect(&gateway, "BTC", "1h");
    let (b, _rx_b) = connect(&gateway, "BTC", "1h");
    assert!(wait_until(|| feed.is_live(&btc_1h())).await);

    gateway.on_client_message(&a, r#"{"action":"subscribe","symbol":"ETH","interval":"1h"}"#);
    assert_eq!(gateway.subscriber_count(&btc_1h()), 1);
    assert_eq!(gateway.subscriber_count(&eth), 1);
    assert_eq!(feed.close_count(&btc_1h()), 0);

    gateway.on_client_message(&b, r#"{"action":"subscribe","symbol":"ETHUSDT","interval":"1h"}"#);
    assert_eq!(gateway.subscriber_count(&btc_1h()), 0);
    assert_eq!(gateway.subscriber_count(&eth), 2);
    let stats = gateway.stats();
    assert_eq!(stats.active_channels, 1);
    assert_eq!(stats.total_clients, 2);

    assert!(wait_until(|| feed.close_count(&btc_1h()) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(feed.close_count(&btc_1h()), 1);
    assert_eq!(feed.open_count(&eth), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_subscribers_open_one_upstream() {
    let (gateway, feed) = build(GatewayConfig::default());
    feed.set_open_delay(Duration::from_millis(20));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { connect(&gateway, "DOGE", "1m") })
        })
        .collect();
    let mut clients = Vec::new();
    for h in handles {
        clients.push(h.await.unwrap());
    }

    let doge = ChannelKey::new("DOGE", Interval::Min1);
    assert!(wait_until(|| gateway.stats().upstream_connections == 1).await);
    assert_eq!(feed.open_count(&doge), 1);
    assert_eq!(gateway.subscriber_count(&doge), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_churn_never_strands_a_channel() {
    let (gateway, feed) = build(no_grace());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                for _ in 0..25 {
                    let (client, _rx) = connect(&gateway, "XRP", "15m");
                    tokio::task::yield_now().await;
                    gateway.on_client_disconnect(client.id());
                }
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(gateway.stats().active_channels, 0);
    assert_eq!(gateway.upstream_connection_count(), 0);

    let xrp = ChannelKey::new("XRP", Interval::Min15);
    let (_client, _rx) = connect(&gateway, "XRP", "15m");
    assert!(wait_until(|| feed.is_live(&xrp)).await);
    assert_eq!(gateway.upstream_connection_count(), 1);
}

// =============================================================================
// Broadcast
// =============================================================================

#[tokio::test]
async fn test_ticks_arrive_in_order_at_every_subscriber() {
    const TICKS: i64 = 50;
    let (gateway, feed) = build(GatewayConfig::default().with_client_buffer(128));
    let mut receivers: Vec<Rx> = (0..5)
        .map(|_| connect(&gateway, "BTC", "1h").1)
        .collect();
    assert!(wait_until(|| feed.is_live(&btc_1h())).await);

    for ts in 0..TICKS {
        assert!(feed.push_tick(&btc_1h(), sample_tick(ts, ts as f64)).await);
    }

    for rx in receivers.iter_mut() {
        let mut seen = Vec::new();
        while seen.len() < TICKS as usize {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("tick delivered")
                .expect("queue open");
            seen.push(decode(&frame).timestamp);
        }
        assert_eq!(seen, (0..TICKS).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_failing_subscriber_does_not_affect_siblings() {
    let (gateway, feed) = build(GatewayConfig::default().with_client_buffer(2));
    let (healthy, mut healthy_rx) = connect(&gateway, "BTC", "1h");
    let (gone, gone_rx) = connect(&gateway, "BTC", "1h");
    let (stuck, _stuck_rx) = connect(&gateway, "BTC", "1h");
    drop(gone_rx);
    assert!(wait_until(|| feed.is_live(&btc_1h())).await);

    for ts in 0..4 {
        feed.push_tick(&btc_1h(), sample_tick(ts, 1.0)).await;
        let frame = tokio::time::timeout(Duration::from_secs(5), healthy_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode(&frame).timestamp, ts);
    }

    assert!(gone.is_closed());
    assert!(stuck.is_closed());
    assert!(!healthy.is_closed());
    assert_eq!(gateway.subscriber_count(&btc_1h()), 1);
    assert_eq!(gateway.channel_of(healthy.id()), Some(btc_1h()));
}

#[tokio::test]
async fn test_broadcast_only_reaches_matching_channel() {
    let (gateway, feed) = build(GatewayConfig::default());
    let (_btc, mut btc_rx) = connect(&gateway, "BTC", "1h");
    let (_eth, mut eth_rx) = connect(&gateway, "ETH", "1h");
    assert!(wait_until(|| feed.live_count() == 2).await);

    feed.push_tick(&btc_1h(), sample_tick(7, 1.0)).await;
    let frame = tokio::time::timeout(Duration::from_secs(5), btc_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(decode(&frame).timestamp, 7);
    assert!(eth_rx.try_recv().is_err());
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_clients_with_grace_window() {
    let (gateway, feed) = build(GatewayConfig::default());

    let (c1, _rx1) = connect(&gateway, "BTC", "1h");
    assert!(wait_until(|| feed.is_live(&btc_1h())).await);
    assert_eq!(feed.open_count(&btc_1h()), 1);

    let (c2, _rx2) = connect(&gateway, "BTC", "1h");
    assert_eq!(feed.open_count(&btc_1h()), 1);
    assert_eq!(gateway.subscriber_count(&btc_1h()), 2);

    gateway.on_client_disconnect(c1.id());
    assert_eq!(gateway.subscriber_count(&btc_1h()), 1);

    gateway.on_client_disconnect(c2.id());
    assert_eq!(gateway.stats().active_channels, 0);
    // Still alive inside the grace window
    assert_eq!(gateway.upstream_connection_count(), 1);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(wait_until(|| feed.close_count(&btc_1h()) == 1).await);
    assert_eq!(gateway.upstream_connection_count(), 0);
    assert_eq!(gateway.stats(), GatewayStats::default());
}

#[tokio::test]
async fn test_missing_interval_is_rejected_without_registration() {
    let (gateway, feed) = build(GatewayConfig::default());
    let (client, _rx) = gateway.new_client();

    let err = gateway
        .on_client_connect(&client, Some("BTC"), None)
        .unwrap_err();
    assert!(matches!(err, GatewayError::MissingParameter));
    assert_eq!(err.client_code(), "Missing symbol or interval parameter");

    let err = gateway
        .on_client_connect(&client, Some("BTC"), Some("  "))
        .unwrap_err();
    assert!(matches!(err, GatewayError::MissingParameter));

    assert_eq!(gateway.channel_of(client.id()), None);
    assert_eq!(gateway.stats(), GatewayStats::default());
    assert_eq!(feed.total_opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_upstream_error_after_subscribers_left_does_not_reconnect() {
    let (gateway, feed) = build(GatewayConfig::default());
    let (client, _rx) = connect(&gateway, "BTC", "1h");
    assert!(wait_until(|| feed.is_live(&btc_1h())).await);

    gateway.on_client_disconnect(client.id());
    feed.push(&btc_1h(), FeedEvent::Error("connection reset".into()))
        .await;

    assert!(wait_until(|| gateway.upstream_connection_count() == 0).await);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(feed.open_count(&btc_1h()), 1);
    assert_eq!(gateway.stats(), GatewayStats::default());
}

#[tokio::test(start_paused = true)]
async fn test_upstream_drop_with_subscribers_reconnects() {
    let (gateway, feed) = build(GatewayConfig::default());
    let (_client, mut rx) = connect(&gateway, "BTC", "1h");
    assert!(wait_until(|| feed.is_live(&btc_1h())).await);

    feed.fail_next_opens(2);
    feed.push(&btc_1h(), FeedEvent::Closed).await;

    assert!(wait_until(|| feed.open_count(&btc_1h()) == 4).await);
    assert!(wait_until(|| feed.is_live(&btc_1h())).await);
    assert_eq!(gateway.stats().upstream_connections, 1);

    feed.push_tick(&btc_1h(), sample_tick(99, 2.0)).await;
    let frame = rx.recv().await.unwrap();
    assert_eq!(decode(&frame).timestamp, 99);
}

#[tokio::test(start_paused = true)]
async fn test_channel_reopens_after_degrade() {
    let (gateway, feed) = build(GatewayConfig::default());
    feed.fail_opens("dns failure");

    let (first, mut first_rx) = connect(&gateway, "BTC", "1h");
    assert!(wait_until(|| first.is_closed()).await);
    let notice: HashMap<String, String> =
        serde_json::from_str(&first_rx.recv().await.unwrap()).unwrap();
    assert_eq!(notice["error"], "UpstreamUnavailable");
    assert_eq!(notice["channel"], "BTC:1h");
    assert_eq!(gateway.stats(), GatewayStats::default());

    feed.accept_opens();
    let (_second, _rx) = connect(&gateway, "BTC", "1h");
    assert!(wait_until(|| feed.is_live(&btc_1h())).await);
    assert_eq!(gateway.stats().upstream_connections, 1);
}
