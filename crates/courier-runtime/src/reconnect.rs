//! Bounded exponential backoff for transport reconnects.
//!
//! Pure and clock-free so the attempt ceiling and reset-on-open invariants
//! are unit-testable without real delays.

use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_BASE_DELAY_MS: u64 = 3_000;
pub const MAX_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    base_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            base_delay_ms: base_delay_ms.max(1),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the delay for the next reconnect attempt and increments the
    /// counter, or None once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let exponent = self.attempts.min(31);
        let scaled = self.base_delay_ms.saturating_mul(1_u64 << exponent);
        self.attempts = self.attempts.saturating_add(1);
        Some(Duration::from_millis(scaled.min(MAX_DELAY_MS)))
    }

    /// Clears the counter after a successful open transition. This is the
    /// only reset, so backoff escalates across consecutive failures and fully
    /// recovers after any period of stability.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY_MS)
    }
}
