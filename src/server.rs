//! Listener loops for the SOCKS and HTTP proxy fronts.
use crate::auth::Authenticator;
use crate::ca::Authority;
use crate::cache::{IdentityCache, LeafIssuer};
use crate::config::ProxyConfig;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::http_proxy::{HttpProxyHandler, Interception, ProxyAuthGate};
use crate::inspect::Inspector;
use crate::socks::SocksHandler;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Builder for `ProxyServer`.
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: Option<ProxyConfig>,
  authenticator: Option<Arc<dyn Authenticator>>,
  inspector: Option<Arc<dyn Inspector>>,
  authority: Option<Arc<Authority>>,
}

impl ProxyServerBuilder {
  /// Set the `ProxyConfig` to use.
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = Some(config);
    self
  }

  /// Require credentials on both fronts.
  pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
    self.authenticator = Some(Arc::new(authenticator));
    self
  }

  /// Receive decoded requests. Together with an authority this turns on
  /// `CONNECT` interception.
  pub fn inspector(mut self, inspector: impl Inspector + 'static) -> Self {
    self.inspector = Some(Arc::new(inspector));
    self
  }

  /// Sign forged leaves with `authority`.
  pub fn authority(mut self, authority: Authority) -> Self {
    self.authority = Some(Arc::new(authority));
    self
  }

  /// Build the `ProxyServer`.
  pub fn build(self) -> Result<ProxyServer> {
    let config = self.config.unwrap_or_default();
    let connector = Connector::builder()
      .connect_timeout(config.connect_timeout)
      .nodelay(config.nodelay)
      .keepalive(config.keepalive)
      .build()?;

    let socks = SocksHandler::new(connector.clone(), self.authenticator.clone());

    let mut http = HttpProxyHandler::new(connector, config.max_content_length);
    if let Some(authenticator) = &self.authenticator {
      http = http.with_gate(ProxyAuthGate::new(authenticator.clone(), config.realm.clone()));
    }
    let mut cache = None;
    if let Some(inspector) = &self.inspector {
      http = http.with_inspector(inspector.clone());
      match &self.authority {
        Some(authority) => {
          let issuer: Arc<dyn LeafIssuer> = authority.clone();
          let identities = Arc::new(IdentityCache::with_capacity(issuer, config.cache_capacity));
          http = http.with_interception(Arc::new(Interception::new(
            authority.clone(),
            identities.clone(),
            inspector.clone(),
          )));
          cache = Some(identities);
        }
        None => tracing::warn!("inspector set without an authority, CONNECT stays tunnel-only"),
      }
    }

    Ok(ProxyServer {
      config,
      socks,
      http,
      cache,
    })
  }
}

/// Both proxy fronts, sharing one outbound connector and identity cache.
pub struct ProxyServer {
  config: ProxyConfig,
  socks: SocksHandler,
  http: HttpProxyHandler,
  cache: Option<Arc<IdentityCache>>,
}

impl ProxyServer {
  /// Start building a server.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// The configuration in use.
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Forged leaves, present when interception is on.
  pub fn identity_cache(&self) -> Option<&Arc<IdentityCache>> {
    self.cache.as_ref()
  }

  /// Bind both configured addresses and serve until a listener fails.
  pub async fn run(&self) -> Result<()> {
    let socks = TcpListener::bind(self.config.socks_addr).await?;
    let http = TcpListener::bind(self.config.http_addr).await?;
    tokio::try_join!(self.serve_socks(socks), self.serve_http(http))?;
    Ok(())
  }

  /// Accept SOCKS clients on `listener`, one task per connection.
  pub async fn serve_socks(&self, listener: TcpListener) -> Result<()> {
    tracing::info!("socks proxy listening on {}", listener.local_addr()?);
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          tracing::debug!("socks client {}", peer_addr);
          let handler = self.socks.clone();
          tokio::spawn(async move {
            if let Err(e) = handler.handle(stream).await {
              log_connection_error("socks", peer_addr, &e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept socks connection: {}", e);
        }
      }
    }
  }

  /// Accept HTTP proxy clients on `listener`, one task per connection.
  pub async fn serve_http(&self, listener: TcpListener) -> Result<()> {
    tracing::info!("http proxy listening on {}", listener.local_addr()?);
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          tracing::debug!("http client {}", peer_addr);
          let handler = self.http.clone();
          tokio::spawn(async move {
            if let Err(e) = handler.handle(stream).await {
              log_connection_error("http", peer_addr, &e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept http connection: {}", e);
        }
      }
    }
  }
}

fn log_connection_error(front: &str, peer_addr: std::net::SocketAddr, e: &Error) {
  match e {
    e if e.is_disconnect() => tracing::debug!("[{}] {} disconnected: {}", front, peer_addr, e),
    // already logged where they were raised
    Error::CertificateBuild(_) | Error::CertificateGeneration(_) => {}
    _ => tracing::warn!("[{}] {} closed: {}", front, peer_addr, e),
  }
}
