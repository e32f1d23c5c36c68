//! Reconnect backoff with a hard attempt ceiling.

use std::time::Duration;

/// Reconnect delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts allowed before giving up for good.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: `min(base * 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let multiplier = 1u128.checked_shl(shift).unwrap_or(u128::MAX);
        let exp_ms = self.base_delay.as_millis().saturating_mul(multiplier);
        let capped_ms = exp_ms.min(self.max_delay.as_millis());
        Duration::from_millis(capped_ms.min(u64::MAX as u128) as u64)
    }
}

/// Attempt counter driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Advance to the next attempt and return its delay, or `None` once the
    /// ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay_for(self.attempt))
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
