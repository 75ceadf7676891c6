use crate::errors::{Error, Result};
use crate::tls;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Default limit for establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  connect_timeout: Duration,
  nodelay: bool,
  keepalive: bool,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: DEFAULT_CONNECT_TIMEOUT,
      nodelay: false,
      keepalive: false,
    }
  }
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `false`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Set a timeout covering name resolution and the TCP handshake.
  ///
  /// Default is 15 seconds.
  pub fn connect_timeout(mut self, timeout: Duration) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Combine the configuration of this builder with a TLS client to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      tls: tls::insecure_connector()?,
    })
  }
}

/// Opens outbound connections to proxied targets.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Duration,
  nodelay: bool,
  keepalive: bool,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("nodelay", &self.nodelay)
      .field("keepalive", &self.keepalive)
      .finish_non_exhaustive()
  }
}

impl Connector {
  /// Start building a connector.
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }

  /// Connect to `host:port`, trying each resolved address in turn.
  ///
  /// Any failure, including the timeout, is reported as `OutboundConnect`.
  pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
    let target = format!("{}:{}", host, port);
    match tokio::time::timeout(self.connect_timeout, self.dial(host, port)).await {
      Ok(Ok(stream)) => Ok(stream),
      Ok(Err(source)) => Err(Error::OutboundConnect { target, source }),
      Err(_) => Err(Error::OutboundConnect {
        target,
        source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
      }),
    }
  }

  /// Connect to `host:port` and complete a TLS handshake as a client.
  pub async fn connect_tls(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
    let stream = self.connect(host, port).await?;
    let domain = tls::server_name(host)?;
    let handshake = self.tls.connect(domain, stream);
    match tokio::time::timeout(self.connect_timeout, handshake).await {
      Ok(Ok(tls)) => Ok(tls),
      Ok(Err(source)) => Err(Error::OutboundConnect {
        target: format!("{}:{}", host, port),
        source,
      }),
      Err(_) => Err(Error::OutboundConnect {
        target: format!("{}:{}", host, port),
        source: std::io::Error::new(std::io::ErrorKind::TimedOut, "tls handshake timed out"),
      }),
    }
  }

  async fn dial(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => last_error = Some(e),
      }
    }
    Err(last_error.unwrap_or_else(|| {
      std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
  }

  /// Connect to a remote endpoint with addr
  async fn connect_with_addr(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    raw_socket.set_keepalive(self.keepalive)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    socket.connect(addr).await
  }
}
