//! Reconnection backoff state machine
//!
//! Kept separate from the socket supervision so the delay schedule is
//! testable in isolation.

use std::time::Duration;

/// Exponential backoff: `min(max, base * 2^attempts)`, reset to zero
/// attempts on a successful open.
#[derive(Debug)]
pub struct Backoff {
    attempts: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            attempts: 0,
            base,
            max,
        }
    }

    /// Delay before the next attempt; increments the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempts
    }

    /// Called after a successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
