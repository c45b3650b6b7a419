//! Gateway: the surface client transports talk to
//!
//! Composes the subscription registry and the upstream manager. Every
//! registry transition and the connection decision it implies run under one
//! lifecycle lock, so a deferred close, an upstream failure report and a new
//! subscribe are totally ordered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelCatalog, ChannelKey};
use crate::client::{ClientHandle, ClientId, DeliveryError, Frame};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::message::{ClientRequest, ServerNotice, TickEvent};
use crate::metrics;
use crate::registry::SubscriptionRegistry;
use crate::traits::FeedProvider;
use crate::upstream::{ChannelSink, ConnectionState, UpstreamManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub active_channels: usize,
    pub total_clients: usize,
    /// Upstream connections currently open
    pub upstream_connections: usize,
}

/// Pending grace-window teardowns, keyed by channel
#[derive(Default)]
struct Lifecycle {
    pending_close: HashMap<ChannelKey, u64>,
    next_token: u64,
}

pub struct Gateway {
    me: Weak<Gateway>,
    catalog: ChannelCatalog,
    registry: SubscriptionRegistry,
    upstream: UpstreamManager,
    lifecycle: Mutex<Lifecycle>,
    grace_period: Duration,
    client_buffer: usize,
    shutting_down: AtomicBool,
}

impl Gateway {
    pub fn new(
        catalog: ChannelCatalog,
        provider: Arc<dyn FeedProvider>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Gateway>| {
            let sink: Weak<dyn ChannelSink> = me.clone();
            Gateway {
                me: me.clone(),
                catalog,
                registry: SubscriptionRegistry::new(),
                upstream: UpstreamManager::new(provider, config.retry, sink),
                lifecycle: Mutex::new(Lifecycle::default()),
                grace_period: config.grace_period,
                client_buffer: config.client_buffer,
                shutting_down: AtomicBool::new(false),
            }
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn catalog(&self) -> &ChannelCatalog {
        &self.catalog
    }

    /// Allocate a handle for a newly accepted client.
    pub fn new_client(&self) -> (Arc<ClientHandle>, mpsc::Receiver<Frame>) {
        ClientHandle::new(self.client_buffer)
    }

    /// Validate the handshake parameters and subscribe `client`.
    ///
    /// Nothing is registered on error; the transport reports the error and
    /// closes the socket.
    pub fn on_client_connect(
        &self,
        client: &Arc<ClientHandle>,
        symbol: Option<&str>,
        interval: Option<&str>,
    ) -> Result<ChannelKey, GatewayError> {
        let key = self.catalog.resolve(symbol, interval)?;
        self.subscribe(client, &key)?;
        info!(client_id = client.id(), channel = %key, "client connected");
        Ok(key)
    }

    /// Handle a text frame from a connected client and produce the reply.
    pub fn on_client_message(&self, client: &Arc<ClientHandle>, text: &str) -> ServerNotice {
        let request = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(client_id = client.id(), error = %e, "unrecognized client message");
                return ServerNotice::error("InvalidMessage");
            }
        };

        match request {
            ClientRequest::Ping => ServerNotice::pong(),
            ClientRequest::Subscribe { symbol, interval } => {
                let result = self
                    .catalog
                    .resolve(symbol.as_deref(), interval.as_deref())
                    .and_then(|key| self.subscribe(client, &key).map(|_| key));
                match result {
                    Ok(key) => {
                        info!(client_id = client.id(), channel = %key, "client switched channel");
                        ServerNotice::subscribed(key.to_string())
                    }
                    Err(e) => {
                        debug!(client_id = client.id(), error = %e, "subscribe request rejected");
                        ServerNotice::error(e.client_code())
                    }
                }
            }
        }
    }

    /// Remove `client_id` from its channel. Safe to call more than once.
    pub fn on_client_disconnect(&self, client_id: ClientId) {
        let mut lifecycle = self.lifecycle();
        if let Some(release) = self.registry.unsubscribe(client_id) {
            info!(client_id, channel = %release.key, "client disconnected");
            if release.emptied {
                self.release_channel(&mut lifecycle, release.key);
            }
        }
    }

    fn subscribe(&self, client: &Arc<ClientHandle>, key: &ChannelKey) -> Result<(), GatewayError> {
        let mut lifecycle = self.lifecycle();

        if self.shutting_down.load(Ordering::Acquire) {
            return Err(GatewayError::UpstreamUnavailable {
                channel: key.to_string(),
                reason: "gateway shutting down".to_string(),
            });
        }
        // A closed handle is on its way out; re-adding it would leak
        if client.is_closed() {
            return Err(GatewayError::ClientWriteFailure(client.id()));
        }

        let outcome = self.registry.subscribe(client, key);
        if outcome.activated {
            lifecycle.pending_close.remove(key);
            if !self.upstream.ensure_connection(key) {
                debug!(channel = %key, "reusing upstream connection");
            }
        }
        if let Some(release) = outcome.released {
            if release.emptied {
                self.release_channel(&mut lifecycle, release.key);
            }
        }
        Ok(())
    }

    /// Channel `key` lost its last subscriber. Caller holds the lifecycle lock.
    fn release_channel(&self, lifecycle: &mut Lifecycle, key: ChannelKey) {
        if self.grace_period.is_zero() {
            self.upstream.close_connection(&key);
            return;
        }

        lifecycle.next_token += 1;
        let token = lifecycle.next_token;
        lifecycle.pending_close.insert(key.clone(), token);
        debug!(channel = %key, grace_ms = self.grace_period.as_millis() as u64, "upstream close scheduled");

        let me = self.me.clone();
        let grace = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(gateway) = me.upgrade() {
                gateway.finish_release(&key, token);
            }
        });
    }

    fn finish_release(&self, key: &ChannelKey, token: u64) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.pending_close.get(key) != Some(&token) {
            return;
        }
        lifecycle.pending_close.remove(key);
        if self.registry.subscriber_count(key) == 0 && self.upstream.close_connection(key) {
            info!(channel = %key, "upstream closed after grace period");
        }
    }

    /// Fan a tick out to every current subscriber of `key`.
    ///
    /// The payload is serialized once. Clients whose queue is full or closed
    /// are disconnected; the rest are unaffected.
    pub fn broadcast(&self, key: &ChannelKey, tick: &TickEvent) {
        let subscribers = self.registry.subscribers_of(key);
        if subscribers.is_empty() {
            return;
        }

        let frame: Frame = match serde_json::to_string(tick) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(channel = %key, error = %e, "failed to serialize tick");
                return;
            }
        };

        let mut delivered = 0;
        for client in &subscribers {
            match client.try_deliver(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => self.drop_client(client, key, e),
            }
        }
        metrics::inc_ticks_delivered(&key.channel_name(), delivered);
    }

    fn drop_client(&self, client: &Arc<ClientHandle>, key: &ChannelKey, cause: DeliveryError) {
        if !client.close() {
            return;
        }
        let err = GatewayError::ClientWriteFailure(client.id());
        warn!(client_id = client.id(), channel = %key, cause = %cause, error = %err, "dropping client");
        metrics::inc_client_drop(match cause {
            DeliveryError::Full => "slow",
            DeliveryError::Closed => "closed",
        });
        self.on_client_disconnect(client.id());
    }

    pub fn stats(&self) -> GatewayStats {
        let registry = self.registry.stats();
        GatewayStats {
            active_channels: registry.active_channels,
            total_clients: registry.total_clients,
            upstream_connections: self.upstream.open_count(),
        }
    }

    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.registry.subscriber_count(key)
    }

    pub fn channel_of(&self, client_id: ClientId) -> Option<ChannelKey> {
        self.registry.key_of(client_id)
    }

    pub fn upstream_state(&self, key: &ChannelKey) -> Option<ConnectionState> {
        self.upstream.state(key)
    }

    /// Upstream connection records in any state, including ones in a grace window
    pub fn upstream_connection_count(&self) -> usize {
        self.upstream.connection_count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Close every upstream connection and every client.
    pub async fn shutdown(&self) {
        {
            // Under the lifecycle lock so no subscribe can activate a channel after this
            let _lifecycle = self.lifecycle();
            if self.shutting_down.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        info!("gateway shutting down");

        self.upstream.shutdown().await;

        let clients = {
            let mut lifecycle = self.lifecycle();
            lifecycle.pending_close.clear();
            self.registry.drain()
        };
        for client in &clients {
            if client.close() {
                metrics::inc_client_drop("shutdown");
            }
        }
        info!(clients = clients.len(), "gateway shutdown complete");
    }
}

impl ChannelSink for Gateway {
    fn on_tick(&self, key: &ChannelKey, tick: TickEvent) {
        self.broadcast(key, &tick);
    }

    fn on_upstream_lost(&self, key: &ChannelKey, generation: u64) -> bool {
        let _lifecycle = self.lifecycle();
        if self.upstream.generation(key) != Some(generation) {
            return false;
        }
        if self.registry.subscriber_count(key) > 0 && !self.is_shutting_down() {
            return true;
        }
        self.upstream.forget(key, generation);
        false
    }

    fn on_upstream_degraded(&self, key: &ChannelKey, generation: u64, reason: &str) {
        let mut lifecycle = self.lifecycle();
        if !self.upstream.forget(key, generation) {
            return;
        }
        lifecycle.pending_close.remove(key);

        let err = GatewayError::UpstreamUnavailable {
            channel: key.to_string(),
            reason: reason.to_string(),
        };
        let evicted = self.registry.evict_channel(key);
        error!(channel = %key, clients = evicted.len(), error = %err, "channel degraded, disconnecting subscribers");

        let notice = ServerNotice::channel_error(err.client_code(), key.to_string());
        for client in evicted {
            client.notify(&notice);
            if client.close() {
                metrics::inc_client_drop("degraded");
            }
        }
    }
}
