//! Subscription registry
//!
//! Bidirectional index between channels and clients. Both directions live
//! behind one lock so every operation, including `stats`, sees a single
//! consistent state. The lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

use crate::channel::ChannelKey;
use crate::client::{ClientHandle, ClientId};

/// A client leaving a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub key: ChannelKey,
    /// The channel has no subscribers left
    pub emptied: bool,
}

/// Result of `subscribe`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscribeOutcome {
    /// Target channel went from zero to one subscriber
    pub activated: bool,
    /// Previous channel, when the client was moved
    pub released: Option<Release>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_channels: usize,
    pub total_clients: usize,
}

#[derive(Default)]
struct RegistryState {
    channels: HashMap<ChannelKey, HashMap<ClientId, Arc<ClientHandle>>>,
    clients: HashMap<ClientId, ChannelKey>,
}

impl RegistryState {
    /// Remove `client_id` from `key`'s set, dropping the set when empty.
    fn detach(&mut self, client_id: ClientId, key: &ChannelKey) -> bool {
        let Some(set) = self.channels.get_mut(key) else {
            return false;
        };
        set.remove(&client_id);
        if set.is_empty() {
            self.channels.remove(key);
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Mutations never panic midway, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe `client` to `key`, moving it off any previous channel.
    pub fn subscribe(&self, client: &Arc<ClientHandle>, key: &ChannelKey) -> SubscribeOutcome {
        let mut state = self.lock();
        let client_id = client.id();

        let released = match state.clients.get(&client_id).cloned() {
            Some(current) if &current == key => return SubscribeOutcome::default(),
            Some(previous) => {
                let emptied = state.detach(client_id, &previous);
                Some(Release {
                    key: previous,
                    emptied,
                })
            }
            None => None,
        };

        let set = state.channels.entry(key.clone()).or_default();
        let activated = set.is_empty();
        set.insert(client_id, Arc::clone(client));
        state.clients.insert(client_id, key.clone());

        debug!(client_id, channel = %key, activated, moved = released.is_some(), "client subscribed");

        SubscribeOutcome {
            activated,
            released,
        }
    }

    /// Remove `client_id` from its channel. `None` if it had no subscription.
    pub fn unsubscribe(&self, client_id: ClientId) -> Option<Release> {
        let mut state = self.lock();
        let key = state.clients.remove(&client_id)?;
        let emptied = state.detach(client_id, &key);
        debug!(client_id, channel = %key, emptied, "client unsubscribed");
        Some(Release { key, emptied })
    }

    /// Snapshot of the current subscribers of `key`
    pub fn subscribers_of(&self, key: &ChannelKey) -> Vec<Arc<ClientHandle>> {
        self.lock()
            .channels
            .get(key)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.lock().channels.get(key).map_or(0, HashMap::len)
    }

    pub fn key_of(&self, client_id: ClientId) -> Option<ChannelKey> {
        self.lock().clients.get(&client_id).cloned()
    }

    pub fn active_keys(&self) -> Vec<ChannelKey> {
        self.lock().channels.keys().cloned().collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.lock();
        RegistryStats {
            active_channels: state.channels.len(),
            total_clients: state.clients.len(),
        }
    }

    /// Remove every subscription of `key`, returning the evicted clients.
    pub fn evict_channel(&self, key: &ChannelKey) -> Vec<Arc<ClientHandle>> {
        let mut state = self.lock();
        let Some(set) = state.channels.remove(key) else {
            return Vec::new();
        };
        for client_id in set.keys() {
            state.clients.remove(client_id);
        }
        set.into_values().collect()
    }

    /// Remove everything, returning every client that was subscribed.
    pub fn drain(&self) -> Vec<Arc<ClientHandle>> {
        let mut state = self.lock();
        state.clients.clear();
        state
            .channels
            .drain()
            .flat_map(|(_, set)| set.into_values())
            .collect()
    }
}
