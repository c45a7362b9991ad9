//! Exponential retry delay.

use std::time::Duration;

use crate::core::{RECONNECT_BACKOFF, RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY, RpcError};

/// Reconnect timing.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after each failure.
    pub multiplier: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: RECONNECT_INITIAL_DELAY,
            max_delay: RECONNECT_MAX_DELAY,
            multiplier: RECONNECT_BACKOFF,
        }
    }
}

impl ReconnectConfig {
    /// Check that the delays make sense.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.initial_delay.is_zero() {
            return Err(RpcError::Config("initial_delay must be non-zero".into()));
        }
        if self.max_delay < self.initial_delay {
            return Err(RpcError::Config("max_delay is below initial_delay".into()));
        }
        if self.multiplier == 0 {
            return Err(RpcError::Config("multiplier must be at least 1".into()));
        }
        Ok(())
    }
}

/// Delay sequence `initial, initial * m, initial * m², ...` capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Start a fresh sequence.
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);
        self.current = self
            .current
            .saturating_mul(self.config.multiplier)
            .min(self.config.max_delay);
        delay
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
