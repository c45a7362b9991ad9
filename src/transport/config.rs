//! Connection configuration.

use std::time::Duration;

use crate::core::{
    DEFAULT_DIAL_TIMEOUT, DEFAULT_INBOUND_CAPACITY, DEFAULT_OUTBOUND_CAPACITY,
    DEFAULT_READ_BUFFER_SIZE, MAX_MISSED_PINGS, RpcError,
};
use crate::crypto::NonceMode;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Read inactivity before a ping is sent. `None` disables keepalive.
    pub keepalive: Option<Duration>,

    /// Deadline for TCP connect plus key exchange.
    pub dial_timeout: Duration,

    /// Negotiate a shared secret and seal every frame.
    pub encrypt: bool,

    /// Nonce selection for sealed frames.
    pub nonce_mode: NonceMode,

    /// Outbound queue depth.
    pub outbound_capacity: usize,

    /// Depth of the read-to-dispatch hand-off.
    pub inbound_capacity: usize,

    /// Initial read buffer size in bytes.
    pub read_buffer_size: usize,

    /// Unanswered keepalive timeouts before the connection is torn down.
    pub max_missed_pings: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            encrypt: false,
            nonce_mode: NonceMode::default(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_missed_pings: MAX_MISSED_PINGS,
        }
    }
}

impl ConnectionConfig {
    /// Check that every field is usable.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.dial_timeout.is_zero() {
            return Err(RpcError::Config("dial_timeout must be non-zero".into()));
        }
        if self.keepalive.is_some_and(|k| k.is_zero()) {
            return Err(RpcError::Config("keepalive must be non-zero".into()));
        }
        if self.outbound_capacity == 0 || self.inbound_capacity == 0 {
            return Err(RpcError::Config("channel capacities must be non-zero".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(RpcError::Config("read_buffer_size must be non-zero".into()));
        }
        if self.max_missed_pings == 0 {
            return Err(RpcError::Config("max_missed_pings must be at least 1".into()));
        }
        Ok(())
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
        }
    }

    /// Set the keepalive interval.
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.config.keepalive = Some(interval);
        self
    }

    /// Set the dial timeout.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    /// Enable or disable frame encryption.
    pub fn encrypt(mut self, enabled: bool) -> Self {
        self.config.encrypt = enabled;
        self
    }

    /// Set the nonce mode for sealed frames.
    pub fn nonce_mode(mut self, mode: NonceMode) -> Self {
        self.config.nonce_mode = mode;
        self
    }

    /// Set the outbound queue depth.
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.config.outbound_capacity = capacity;
        self
    }

    /// Set the inbound hand-off depth.
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.config.inbound_capacity = capacity;
        self
    }

    /// Set the initial read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set how many keepalive timeouts may go unanswered.
    pub fn max_missed_pings(mut self, count: u32) -> Self {
        self.config.max_missed_pings = count;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<ConnectionConfig, RpcError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert!(config.keepalive.is_none());
        assert!(!config.encrypt);
        assert_eq!(config.nonce_mode, NonceMode::Random);
        assert_eq!(config.max_missed_pings, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ConnectionConfigBuilder::new()
            .keepalive(Duration::from_secs(10))
            .dial_timeout(Duration::from_secs(2))
            .encrypt(true)
            .outbound_capacity(16)
            .build()
            .unwrap();

        assert_eq!(config.keepalive, Some(Duration::from_secs(10)));
        assert_eq!(config.dial_timeout, Duration::from_secs(2));
        assert!(config.encrypt);
        assert_eq!(config.outbound_capacity, 16);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            ConnectionConfigBuilder::new()
                .dial_timeout(Duration::ZERO)
                .build(),
            Err(RpcError::Config(_))
        ));
        assert!(ConnectionConfigBuilder::new()
            .keepalive(Duration::ZERO)
            .build()
            .is_err());
        assert!(ConnectionConfigBuilder::new()
            .inbound_capacity(0)
            .build()
            .is_err());
        assert!(ConnectionConfigBuilder::new()
            .max_missed_pings(0)
            .build()
            .is_err());
    }
}
