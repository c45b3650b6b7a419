//! HTTP and WebSocket surface
//!
//! `/ws/market` is the client transport; the rest are operational endpoints.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{ClientHandle, Frame};
use crate::gateway::{Gateway, GatewayStats};
use crate::message::ServerNotice;
use crate::metrics;

/// A socket write that takes longer than this drops the client
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// WS-level keepalive towards clients
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub feed: String,
    pub upstream_connections: usize,
}

/// Handshake parameters of `/ws/market`
#[derive(Debug, Default, Deserialize)]
pub struct MarketQuery {
    pub symbol: Option<String>,
    pub interval: Option<String>,
}

#[derive(Clone)]
pub struct ServerState {
    pub feed_name: String,
    pub gateway: Arc<Gateway>,
    /// Set once the listener is bound
    pub ready: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new(feed_name: impl Into<String>, gateway: Arc<Gateway>) -> Self {
        Self {
            feed_name: feed_name.into(),
            gateway,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Health endpoint - always returns 200 if server is running
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        feed: state.feed_name.clone(),
        upstream_connections: state.gateway.stats().upstream_connections,
    })
}

/// Ready endpoint - 200 while accepting clients
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let ready = state.ready.load(Ordering::SeqCst) && !state.gateway.is_shutting_down();
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            feed: state.feed_name.clone(),
            upstream_connections: state.gateway.stats().upstream_connections,
        }),
    )
}

async fn ws_stats(State(state): State<ServerState>) -> Json<GatewayStats> {
    Json(state.gateway.stats())
}

async fn prometheus_metrics() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn market_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<MarketQuery>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.gateway, query))
}

async fn send_with_timeout(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: Message,
) -> Result<(), ()> {
    match tokio::time::timeout(WRITE_TIMEOUT, sender.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "websocket write failed");
            Err(())
        }
        Err(_) => {
            debug!(timeout_secs = WRITE_TIMEOUT.as_secs(), "websocket write timed out");
            Err(())
        }
    }
}

/// Drain the client's queue onto the socket until the handle closes.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    client: Arc<ClientHandle>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = client.closed() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if send_with_timeout(&mut sender, Message::Text(frame.to_string())).await.is_err() {
                    client.close();
                    return;
                }
            }
            _ = ping.tick() => {
                if send_with_timeout(&mut sender, Message::Ping(Vec::new())).await.is_err() {
                    client.close();
                    return;
                }
            }
        }
    }

    // Frames queued before the close, e.g. an UpstreamUnavailable notice
    while let Ok(frame) = rx.try_recv() {
        if send_with_timeout(&mut sender, Message::Text(frame.to_string()))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = send_with_timeout(&mut sender, Message::Close(None)).await;
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, query: MarketQuery) {
    let (mut sender, mut receiver) = socket.split();
    let (client, rx) = gateway.new_client();

    let key = match gateway.on_client_connect(
        &client,
        query.symbol.as_deref(),
        query.interval.as_deref(),
    ) {
        Ok(key) => key,
        Err(e) => {
            warn!(
                symbol = ?query.symbol,
                interval = ?query.interval,
                error = %e,
                "rejecting websocket client"
            );
            let notice = ServerNotice::error(e.client_code()).to_json();
            if send_with_timeout(&mut sender, Message::Text(notice)).await.is_ok() {
                let _ = send_with_timeout(&mut sender, Message::Close(None)).await;
            }
            return;
        }
    };

    metrics::inc_clients_connected();
    let client_id = client.id();
    let mut writer = tokio::spawn(write_loop(sender, rx, Arc::clone(&client)));
    let mut writer_done = false;

    loop {
        tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = gateway.on_client_message(&client, &text);
                    if !client.notify(&reply) {
                        debug!(client_id, "reply dropped, outbound queue unavailable");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client_id, error = %e, "websocket read failed");
                    break;
                }
            },
        }
    }

    client.close();
    gateway.on_client_disconnect(client_id);
    if !writer_done && tokio::time::timeout(WRITE_TIMEOUT, writer).await.is_err() {
        debug!(client_id, "writer did not finish in time");
    }
    metrics::dec_clients_connected();
    debug!(client_id, channel = %key, "websocket session ended");
}

/// Create the gateway router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/ws/market", get(market_ws))
        .route("/market/ws-stats", get(ws_stats))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state.clone());
    state.ready.store(true, Ordering::SeqCst);
    info!(addr = ?listener.local_addr().ok(), "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn run_server<F>(addr: SocketAddr, state: ServerState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelCatalog;
    use crate::config::GatewayConfig;
    use crate::test_helpers::MockFeed;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_state(ready: bool) -> ServerState {
        let gateway = Gateway::new(
            ChannelCatalog::default(),
            Arc::new(MockFeed::new()),
            GatewayConfig::default(),
        );
        let state = ServerState::new("test-feed", gateway);
        state.ready.store(ready, Ordering::SeqCst);
        state
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let app = create_router(create_test_state(false));
        let (status, body) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["feed"], "test-feed");
    }

    #[tokio::test]
    async fn test_ready_when_listening() {
        let app = create_router(create_test_state(true));
        let (status, body) = get_json(app, "/ready").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_not_ready_before_listening() {
        let app = create_router(create_test_state(false));
        let (status, _) = get_json(app, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_not_ready_while_shutting_down() {
        let state = create_test_state(true);
        state.gateway.shutdown().await;
        let (status, _) = get_json(create_router(state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ws_stats_shape() {
        let state = create_test_state(true);
        let (client, _rx) = state.gateway.new_client();
        state
            .gateway
            .on_client_connect(&client, Some("BTC"), Some("1h"))
            .unwrap();

        let (status, body) = get_json(create_router(state), "/market/ws-stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activeChannels"], 1);
        assert_eq!(body["totalClients"], 1);
        assert!(body.get("upstreamConnections").is_some());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::set_upstream_connected("market:SRV:1m", true);
        let app = create_router(create_test_state(true));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("kline_gateway_upstream_connected"));
    }
}
