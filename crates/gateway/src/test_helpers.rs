//! Test helpers for gateway and upstream testing.
//!
//! Provides a `MockFeed` implementing `FeedProvider` with configurable open
//! behavior. Tests push events into live sessions and assert on open/close
//! counts per channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::ChannelKey;
use crate::error::FeedError;
use crate::message::TickEvent;
use crate::traits::{FeedEvent, FeedProvider, FeedSession};

/// Internal state for MockFeed.
#[derive(Debug, Default)]
pub struct MockFeedState {
    /// Open attempts per channel, successful or not.
    pub opens: HashMap<ChannelKey, usize>,
    /// Explicit `close` calls per channel.
    pub closes: HashMap<ChannelKey, usize>,
    /// Fail this many upcoming opens, then fall back to `fail_reason`.
    pub fail_next: usize,
    /// When set, every open fails with this reason.
    pub fail_reason: Option<String>,
    /// Delay before an open resolves.
    pub open_delay: Duration,
    /// Delay before a session close completes.
    pub close_delay: Duration,
    /// Sessions per channel not yet dropped, and the most seen at once.
    sessions: HashMap<ChannelKey, usize>,
    peak_sessions: HashMap<ChannelKey, usize>,
    live: HashMap<ChannelKey, (u64, mpsc::Sender<FeedEvent>)>,
    next_session: u64,
}

/// A mock feed provider for testing.
///
/// Cloning shares the state, so a test keeps one clone and hands another to
/// the gateway.
#[derive(Clone, Default)]
pub struct MockFeed {
    pub state: Arc<Mutex<MockFeedState>>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockFeedState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make every subsequent open fail.
    pub fn fail_opens(&self, reason: &str) {
        self.lock().fail_reason = Some(reason.to_string());
    }

    /// Fail the next `count` opens, then accept again.
    pub fn fail_next_opens(&self, count: usize) {
        self.lock().fail_next = count;
    }

    pub fn accept_opens(&self) {
        let mut state = self.lock();
        state.fail_reason = None;
        state.fail_next = 0;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = delay;
    }

    pub fn set_close_delay(&self, delay: Duration) {
        self.lock().close_delay = delay;
    }

    /// Most sessions for `key` that existed at the same time.
    pub fn peak_sessions(&self, key: &ChannelKey) -> usize {
        self.lock().peak_sessions.get(key).copied().unwrap_or(0)
    }

    pub fn open_count(&self, key: &ChannelKey) -> usize {
        self.lock().opens.get(key).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.lock().opens.values().sum()
    }

    pub fn close_count(&self, key: &ChannelKey) -> usize {
        self.lock().closes.get(key).copied().unwrap_or(0)
    }

    /// A session for `key` is currently open.
    pub fn is_live(&self, key: &ChannelKey) -> bool {
        self.lock().live.contains_key(key)
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Push an event into the live session for `key`.
    pub async fn push(&self, key: &ChannelKey, event: FeedEvent) -> bool {
        let tx = match self.lock().live.get(key) {
            Some((_, tx)) => tx.clone(),
            None => return false,
        };
        tx.send(event).await.is_ok()
    }

    pub async fn push_tick(&self, key: &ChannelKey, tick: TickEvent) -> bool {
        self.push(key, FeedEvent::Tick(tick)).await
    }
}

#[async_trait]
impl FeedProvider for MockFeed {
    async fn open(&self, key: &ChannelKey) -> Result<Box<dyn FeedSession>, FeedError> {
        let (delay, failure) = {
            let mut state = self.lock();
            *state.opens.entry(key.clone()).or_insert(0) += 1;
            let failure = if state.fail_next > 0 {
                state.fail_next -= 1;
                Some("mock open failure".to_string())
            } else {
                state.fail_reason.clone()
            };
            (state.open_delay, failure)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(FeedError::ConnectionFailed(reason));
        }

        let (tx, rx) = mpsc::channel(64);
        let id = {
            let mut state = self.lock();
            state.next_session += 1;
            let id = state.next_session;
            state.live.insert(key.clone(), (id, tx));
            let current = state.sessions.entry(key.clone()).or_insert(0);
            *current += 1;
            let current = *current;
            let peak = state.peak_sessions.entry(key.clone()).or_insert(0);
            *peak = (*peak).max(current);
            id
        };

        Ok(Box::new(MockSession {
            id,
            key: key.clone(),
            rx,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSession {
    id: u64,
    key: ChannelKey,
    rx: mpsc::Receiver<FeedEvent>,
    state: Arc<Mutex<MockFeedState>>,
}

impl MockSession {
    fn unregister(&self, state: &mut MockFeedState) {
        if state.live.get(&self.key).map(|(id, _)| *id) == Some(self.id) {
            state.live.remove(&self.key);
        }
    }
}

#[async_trait]
impl FeedSession for MockSession {
    async fn recv(&mut self) -> FeedEvent {
        self.rx.recv().await.unwrap_or(FeedEvent::Closed)
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        let delay = self.state.lock().unwrap_or_else(|p| p.into_inner()).close_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *state.closes.entry(self.key.clone()).or_insert(0) += 1;
        self.unregister(&mut state);
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.unregister(&mut state);
        if let Some(current) = state.sessions.get_mut(&self.key) {
            *current = current.saturating_sub(1);
        }
    }
}

/// Build a tick with the given open time and close price.
pub fn sample_tick(timestamp: i64, close: f64) -> TickEvent {
    TickEvent {
        timestamp,
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
        is_final: false,
    }
}

/// Poll `cond` until it holds, giving up after thirty seconds of tokio time.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
