use std::time::Duration;

use crate::client::DEFAULT_CLIENT_BUFFER;
use crate::upstream::RetryPolicy;

/// Default delay between the last unsubscribe and the upstream close
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Runtime knobs for the gateway core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Zero closes the upstream as soon as a channel empties.
    pub grace_period: Duration,
    pub retry: RetryPolicy,
    /// Outbound queue depth per client before it counts as too slow
    pub client_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            retry: RetryPolicy::default(),
            client_buffer: DEFAULT_CLIENT_BUFFER,
        }
    }
}

impl GatewayConfig {
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_client_buffer(mut self, client_buffer: usize) -> Self {
        self.client_buffer = client_buffer;
        self
    }
}
