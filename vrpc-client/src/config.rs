//! Client configuration.

use crate::metrics::TransportMetrics;
use std::sync::Arc;
use std::time::Duration;

/// Default round-trip timeout applied by [`crate::Client::call`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle lifetime of a pooled connection.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on pooled connections per destination.
pub const DEFAULT_POOL_MAX_PER_KEY: usize = 2048;

/// Default read buffer size (4 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024;

/// Default write buffer size (4 KiB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024;

/// Client configuration. Zero values fall back to the defaults above.
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Deadline applied to each call issued without an explicit context.
    pub timeout: Duration,
    /// Idle lifetime of pooled connections.
    pub pool_idle_timeout: Duration,
    /// Cap on pooled connections per destination key.
    pub pool_max_per_key: usize,
    /// Optional response deadline armed after each request is written.
    pub receive_timeout: Option<Duration>,
    /// Read buffer size for connection sockets.
    pub read_buffer_size: usize,
    /// Write buffer size for connection sockets.
    pub write_buffer_size: usize,
    /// Latency histograms for the transport, if enabled.
    pub metrics: Option<Arc<TransportMetrics>>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("timeout", &self.timeout)
            .field("pool_idle_timeout", &self.pool_idle_timeout)
            .field("pool_max_per_key", &self.pool_max_per_key)
            .field("receive_timeout", &self.receive_timeout)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    pub fn with_pool_max_per_key(mut self, max: usize) -> Self {
        self.pool_max_per_key = max;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        if self.pool_idle_timeout.is_zero() {
            DEFAULT_POOL_IDLE_TIMEOUT
        } else {
            self.pool_idle_timeout
        }
    }

    pub fn pool_max_per_key(&self) -> usize {
        if self.pool_max_per_key == 0 {
            DEFAULT_POOL_MAX_PER_KEY
        } else {
            self.pool_max_per_key
        }
    }

    pub fn read_buffer_size(&self) -> usize {
        if self.read_buffer_size == 0 {
            DEFAULT_READ_BUFFER_SIZE
        } else {
            self.read_buffer_size
        }
    }

    pub fn write_buffer_size(&self) -> usize {
        if self.write_buffer_size == 0 {
            DEFAULT_WRITE_BUFFER_SIZE
        } else {
            self.write_buffer_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let config = ClientConfig::new();
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.pool_idle_timeout(), DEFAULT_POOL_IDLE_TIMEOUT);
        assert_eq!(config.pool_max_per_key(), DEFAULT_POOL_MAX_PER_KEY);
        assert_eq!(config.read_buffer_size(), DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.write_buffer_size(), DEFAULT_WRITE_BUFFER_SIZE);
        assert!(config.receive_timeout.is_none());
    }

    #[test]
    fn test_explicit_values_win() {
        let config = ClientConfig::new()
            .with_timeout(Duration::from_millis(100))
            .with_pool_idle_timeout(Duration::from_millis(50))
            .with_pool_max_per_key(2)
            .with_read_buffer_size(1024);
        assert_eq!(config.timeout(), Duration::from_millis(100));
        assert_eq!(config.pool_idle_timeout(), Duration::from_millis(50));
        assert_eq!(config.pool_max_per_key(), 2);
        assert_eq!(config.read_buffer_size(), 1024);
    }
}
