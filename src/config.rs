//! Proxy configuration
use crate::cache::DEFAULT_CAPACITY;
use crate::codec::DEFAULT_MAX_CONTENT_LENGTH;
use crate::connector::DEFAULT_CONNECT_TIMEOUT;
use std::net::SocketAddr;
use std::time::Duration;

/// Default SOCKS listener port.
pub const DEFAULT_SOCKS_PORT: u16 = 19160;
/// Default HTTP proxy listener port.
pub const DEFAULT_HTTP_PORT: u16 = 19161;

/// Configuration for both proxy fronts
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// SOCKS4a/5 listen address
  pub socks_addr: SocketAddr,
  /// HTTP proxy listen address
  pub http_addr: SocketAddr,
  /// Limit for establishing an outbound connection
  pub connect_timeout: Duration,
  /// Largest aggregated HTTP body
  pub max_content_length: usize,
  /// Forged leaves kept before the cache is flushed
  pub cache_capacity: usize,
  /// Realm sent in `Proxy-Authenticate`
  pub realm: String,
  /// `TCP_NODELAY` on outbound sockets
  pub nodelay: bool,
  /// `SO_KEEPALIVE` on outbound sockets
  pub keepalive: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      socks_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SOCKS_PORT)),
      http_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
      connect_timeout: DEFAULT_CONNECT_TIMEOUT,
      max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
      cache_capacity: DEFAULT_CAPACITY,
      realm: "sokcs".to_string(),
      nodelay: false,
      keepalive: false,
    }
  }
}
