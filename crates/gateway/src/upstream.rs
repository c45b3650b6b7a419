//! Upstream connection manager
//!
//! Owns at most one upstream feed connection per channel. Each connection is
//! a task that opens a session, pumps ticks into the [`ChannelSink`], and on
//! failure retries with exponential backoff while the sink still wants the
//! channel.
//!
//! Per-channel lifecycle:
//!
//! ```text
//! ABSENT -> CONNECTING -> OPEN -> CLOSING -> ABSENT
//!                          |
//!                          +--> FAILED -> CONNECTING (retry)
//!                                     \-> ABSENT (no demand / retries exhausted)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelKey;
use crate::message::TickEvent;
use crate::metrics;
use crate::traits::{FeedEvent, FeedProvider, FeedSession};

/// Receiver of everything an upstream connection produces.
///
/// Implemented by the gateway; the manager itself knows nothing about clients.
pub trait ChannelSink: Send + Sync + 'static {
    fn on_tick(&self, key: &ChannelKey, tick: TickEvent);

    /// The upstream for `key` dropped or failed to open. Return `true` to
    /// reconnect; `false` means nobody wants the channel any more and the
    /// implementation has already forgotten connection `generation`.
    fn on_upstream_lost(&self, key: &ChannelKey, generation: u64) -> bool;

    /// Retries are exhausted for connection `generation`.
    fn on_upstream_degraded(&self, key: &ChannelKey, generation: u64, reason: &str);
}

/// Bounded exponential backoff between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before the channel is degraded
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Failed,
    Closing,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Open => 1,
            ConnectionState::Failed => 2,
            ConnectionState::Closing => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Failed,
            _ => ConnectionState::Closing,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Failed => "failed",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Connection record. Dropping it (and with it `shutdown`) stops the task.
struct Connection {
    generation: u64,
    state: Arc<StateCell>,
    shutdown: watch::Sender<bool>,
    /// Flips to true once the task has exited and its session is gone
    exited: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

/// Marks the task as exited when dropped, whichever way it returns.
struct ExitSignal(watch::Sender<bool>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}

pub struct UpstreamManager {
    provider: Arc<dyn FeedProvider>,
    policy: RetryPolicy,
    sink: Weak<dyn ChannelSink>,
    connections: DashMap<ChannelKey, Connection>,
    /// Exit flags of closed connections whose task may still be closing its session
    closing: DashMap<ChannelKey, watch::Receiver<bool>>,
    next_generation: AtomicU64,
}

impl UpstreamManager {
    pub fn new(
        provider: Arc<dyn FeedProvider>,
        policy: RetryPolicy,
        sink: Weak<dyn ChannelSink>,
    ) -> Self {
        Self {
            provider,
            policy,
            sink,
            connections: DashMap::new(),
            closing: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Open a connection for `key` unless one exists.
    ///
    /// The map entry stays locked while the task is spawned, so concurrent
    /// callers for the same key observe exactly one connection. A connection
    /// for a key whose previous session is still closing waits for that close
    /// before opening. Returns true when a new connection was started.
    pub fn ensure_connection(&self, key: &ChannelKey) -> bool {
        match self.connections.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let state = Arc::new(StateCell::new(ConnectionState::Connecting));
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let (exited_tx, exited_rx) = watch::channel(false);
                let predecessor = self
                    .closing
                    .remove(key)
                    .map(|(_, rx)| rx)
                    .filter(|rx| !*rx.borrow());

                let task = tokio::spawn(run_connection(
                    ConnectionTask {
                        key: key.clone(),
                        generation,
                        provider: Arc::clone(&self.provider),
                        sink: self.sink.clone(),
                        policy: self.policy,
                        state: Arc::clone(&state),
                        predecessor,
                        exited: ExitSignal(exited_tx),
                    },
                    shutdown_rx,
                ));

                vacant.insert(Connection {
                    generation,
                    state,
                    shutdown: shutdown_tx,
                    exited: exited_rx,
                    task,
                });
                info!(channel = %key, generation, "upstream connection requested");
                true
            }
        }
    }

    /// Close and forget the connection for `key`. Returns true if one existed.
    pub fn close_connection(&self, key: &ChannelKey) -> bool {
        match self.connections.remove(key) {
            Some((_, conn)) => {
                conn.state.set(ConnectionState::Closing);
                let _ = conn.shutdown.send(true);
                self.closing.retain(|_, exited| !*exited.borrow());
                self.closing.insert(key.clone(), conn.exited);
                info!(channel = %key, generation = conn.generation, "upstream connection closing");
                true
            }
            None => false,
        }
    }

    /// Forget connection `generation` of `key` if it is still the current one.
    pub fn forget(&self, key: &ChannelKey, generation: u64) -> bool {
        self.connections
            .remove_if(key, |_, conn| conn.generation == generation)
            .is_some()
    }

    pub fn state(&self, key: &ChannelKey) -> Option<ConnectionState> {
        self.connections.get(key).map(|conn| conn.state.get())
    }

    pub fn generation(&self, key: &ChannelKey) -> Option<u64> {
        self.connections.get(key).map(|conn| conn.generation)
    }

    /// Connection records in any state
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections currently in the OPEN state
    pub fn open_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.state.get() == ConnectionState::Open)
            .count()
    }

    /// Close every connection and wait (bounded) for the tasks to finish.
    pub async fn shutdown(&self) {
        let keys: Vec<ChannelKey> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut tasks = Vec::with_capacity(keys.len());

        for key in keys {
            if let Some((_, conn)) = self.connections.remove(&key) {
                conn.state.set(ConnectionState::Closing);
                let _ = conn.shutdown.send(true);
                tasks.push(conn.task);
            }
        }

        self.closing.clear();
        info!(count = tasks.len(), "closing all upstream connections");
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("upstream task did not stop within 5s");
            }
        }
    }
}

/// Resolves once shutdown is requested or the connection record is dropped.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn close_session(key: &ChannelKey, session: &mut Box<dyn FeedSession>) {
    if let Err(e) = session.close().await {
        debug!(channel = %key, error = %e, "error closing upstream session");
    }
}

struct ConnectionTask {
    key: ChannelKey,
    generation: u64,
    provider: Arc<dyn FeedProvider>,
    sink: Weak<dyn ChannelSink>,
    policy: RetryPolicy,
    state: Arc<StateCell>,
    /// Exit flag of the previous connection for this key, if still closing
    predecessor: Option<watch::Receiver<bool>>,
    exited: ExitSignal,
}

async fn run_connection(task: ConnectionTask, mut shutdown: watch::Receiver<bool>) {
    let ConnectionTask {
        key,
        generation,
        provider,
        sink,
        policy,
        state,
        predecessor,
        exited: _exited,
    } = task;
    let channel = key.channel_name();
    // Consecutive failures without a tick in between
    let mut failures: u32 = 0;

    if let Some(mut previous) = predecessor {
        debug!(channel = %key, generation, "waiting for previous upstream session to close");
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return,
            _ = previous.wait_for(|done| *done) => {}
        }
    }

    loop {
        state.set(ConnectionState::Connecting);

        let opened = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return,
            result = provider.open(&key) => result,
        };

        let reason = match opened {
            Ok(mut session) => {
                state.set(ConnectionState::Open);
                metrics::set_upstream_connected(&channel, true);
                info!(channel = %key, generation, "upstream connection open");
                let mut proven = false;

                let reason = loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => {
                            state.set(ConnectionState::Closing);
                            close_session(&key, &mut session).await;
                            metrics::set_upstream_connected(&channel, false);
                            info!(channel = %key, generation, "upstream connection closed");
                            return;
                        }
                        event = session.recv() => match event {
                            FeedEvent::Tick(tick) => {
                                let Some(sink) = sink.upgrade() else {
                                    close_session(&key, &mut session).await;
                                    metrics::set_upstream_connected(&channel, false);
                                    return;
                                };
                                if !proven {
                                    // Only a session that delivers data resets the retry budget
                                    proven = true;
                                    failures = 0;
                                }
                                metrics::inc_ticks_received(&channel);
                                sink.on_tick(&key, tick);
                            }
                            FeedEvent::Closed => break "upstream closed the stream".to_string(),
                            FeedEvent::Error(e) => break e,
                        },
                    }
                };
                metrics::set_upstream_connected(&channel, false);
                reason
            }
            Err(e) => e.to_string(),
        };

        state.set(ConnectionState::Failed);
        if *shutdown.borrow() {
            return;
        }

        let Some(target) = sink.upgrade() else {
            return;
        };
        if !target.on_upstream_lost(&key, generation) {
            info!(channel = %key, generation, reason = %reason, "upstream lost with no subscribers, not reconnecting");
            return;
        }

        failures += 1;
        if failures > policy.max_retries {
            error!(
                channel = %key,
                generation,
                attempts = failures - 1,
                reason = %reason,
                "upstream retries exhausted, marking channel degraded"
            );
            metrics::inc_channel_degraded(&channel);
            target.on_upstream_degraded(&key, generation, &reason);
            return;
        }
        drop(target);

        let delay = policy.backoff(failures);
        warn!(
            channel = %key,
            generation,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "upstream unavailable, retrying"
        );
        metrics::inc_upstream_reconnects(&channel);

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
