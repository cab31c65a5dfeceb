//! Reconnection backoff
//!
//! A fixed delay schedule indexed by attempt number, clamped to the last
//! entry. The attempt counter lives in [`Backoff`]; the pending timer itself
//! is a single deadline slot owned by the channel task.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default schedule in milliseconds
pub const DEFAULT_DELAYS_MS: [u64; 5] = [1000, 2000, 4000, 8000, 10000];

/// Delay schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_DELAYS_MS)
    }
}

impl ReconnectPolicy {
    /// Build from millisecond values; an empty list falls back to the default
    pub fn from_millis(delays_ms: &[u64]) -> Self {
        if delays_ms.is_empty() {
            return Self::default();
        }
        Self {
            delays: delays_ms.iter().copied().map(Duration::from_millis).collect(),
        }
    }

    /// Delay before reconnect number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let last = self.delays.len().saturating_sub(1);
        let index = usize::try_from(attempt).map_or(last, |a| a.min(last));
        self.delays.get(index).copied().unwrap_or_default()
    }
}

/// Attempt counter over a [`ReconnectPolicy`]
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the next reconnect
    pub fn next_delay(&self) -> Duration {
        self.policy.delay_for_attempt(self.attempt)
    }

    /// Record that a scheduled reconnect fired
    pub fn advance(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// Back to the first delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Reconnects fired since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
