//! Broker configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::session::DEFAULT_OUTBOX_CAPACITY;
use crate::source::DEFAULT_PAYLOAD_BUFFER_SIZE;

/// Broker configuration options
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Drain chunk size for source fan-out
    pub payload_buffer_size: usize,

    /// Byte budget of each subscriber's outbox
    pub outbox_capacity: usize,

    /// Request/response wait and `block`-policy delivery budget
    pub request_timeout: Duration,

    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7721".parse().unwrap(),
            payload_buffer_size: DEFAULT_PAYLOAD_BUFFER_SIZE,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            request_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
        }
    }
}

impl BrokerConfig {
    /// Create a new config with a custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the fan-out chunk size
    pub fn payload_buffer_size(mut self, size: usize) -> Self {
        self.payload_buffer_size = size.max(1);
        self
    }

    /// Set the per-subscriber outbox byte budget
    pub fn outbox_capacity(mut self, bytes: usize) -> Self {
        self.outbox_capacity = bytes;
        self
    }

    /// Set the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();

        assert_eq!(config.bind_addr.port(), 7721);
        assert_eq!(config.payload_buffer_size, DEFAULT_PAYLOAD_BUFFER_SIZE);
        assert_eq!(config.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = BrokerConfig::default()
            .bind(addr)
            .payload_buffer_size(1024)
            .outbox_capacity(1 << 20)
            .request_timeout(Duration::from_secs(1))
            .nodelay(false);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.payload_buffer_size, 1024);
        assert_eq!(config.outbox_capacity, 1 << 20);
        assert_eq!(config.request_timeout, Duration::from_secs(1));
        assert!(!config.tcp_nodelay);
    }

    #[test]
    fn test_payload_buffer_floor() {
        let config = BrokerConfig::default().payload_buffer_size(0);
        assert_eq!(config.payload_buffer_size, 1);
    }
}
