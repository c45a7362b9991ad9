//! Pool configuration.

use std::time::Duration;

use crate::core::{
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_IDLE_GLOBAL, DEFAULT_MAX_IDLE_PER_ADDRESS,
    DEFAULT_SWEEP_INTERVAL, RpcError,
};
use crate::transport::ConnectionConfig;

/// Idle pool sizing and expiry.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per remote address.
    pub max_idle_per_address: usize,

    /// Idle connections per address that expiry never evicts.
    pub min_idle_per_address: usize,

    /// Idle connections kept across all addresses.
    pub max_idle_global: usize,

    /// Bound on opened-but-not-closed connections. `None` is unbounded.
    pub max_open: Option<usize>,

    /// Period of the shared eviction sweep.
    pub sweep_interval: Duration,

    /// How long a connection may sit idle before the sweep closes it.
    pub idle_timeout: Duration,

    /// Settings for every dialed connection.
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_address: DEFAULT_MAX_IDLE_PER_ADDRESS,
            min_idle_per_address: 0,
            max_idle_global: DEFAULT_MAX_IDLE_GLOBAL,
            max_open: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connection: ConnectionConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Check that the limits are consistent.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.min_idle_per_address > self.max_idle_per_address {
            return Err(RpcError::Config(format!(
                "min_idle_per_address ({}) exceeds max_idle_per_address ({})",
                self.min_idle_per_address, self.max_idle_per_address
            )));
        }
        if self.max_open == Some(0) {
            return Err(RpcError::Config("max_open must be at least 1".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(RpcError::Config("sweep_interval must be non-zero".into()));
        }
        self.connection.validate()
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-address idle cap.
    pub fn max_idle_per_address(mut self, max: usize) -> Self {
        self.config.max_idle_per_address = max;
        self
    }

    /// Set the per-address idle floor kept through expiry.
    pub fn min_idle_per_address(mut self, min: usize) -> Self {
        self.config.min_idle_per_address = min;
        self
    }

    /// Set the global idle cap.
    pub fn max_idle_global(mut self, max: usize) -> Self {
        self.config.max_idle_global = max;
        self
    }

    /// Bound the number of open connections.
    pub fn max_open(mut self, max: usize) -> Self {
        self.config.max_open = Some(max);
        self
    }

    /// Set the sweep period.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the idle expiry.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the settings for dialed connections.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<PoolConfig, RpcError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
