//! HTTP proxy front.
//!
//! Requests are aggregated by [`HttpProxyParse`]. An optional
//! `Proxy-Authorization` gate runs until the first accepted request, then the
//! request is routed one of three ways:
//!
//! - plain HTTP: forwarded to the target, then the connection becomes a raw relay
//! - `CONNECT` without interception: `200 OK`, then a raw tunnel
//! - `CONNECT` with interception: the client's TLS is terminated with a forged
//!   leaf, the target is reached over TLS, and decoded requests are inspected
use crate::auth::{decode_basic_auth, Authenticator};
use crate::ca::Authority;
use crate::cache::IdentityCache;
use crate::codec::RequestDecoder;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::inspect::Inspector;
use crate::message::{Request, Response};
use crate::relay::ConnectionPair;
use crate::socket::Rewind;
use crate::stage::{Layer, Pipeline, ProtocolStage, Stage, Transition};
use crate::tls;
use bytes::{Bytes, BytesMut};
use http::{header, Method, StatusCode};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const TOO_LARGE: &[u8] =
  b"HTTP/1.1 413 Request Entity Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Aggregates proxy requests off the client connection.
pub struct HttpProxyParse {
  decoder: RequestDecoder,
}

impl HttpProxyParse {
  /// Parser rejecting bodies larger than `max_content_length`.
  pub fn new(max_content_length: usize) -> Self {
    Self {
      decoder: RequestDecoder::new(max_content_length),
    }
  }
}

impl Stage for HttpProxyParse {
  type Event = Request;
  fn kind(&self) -> ProtocolStage {
    ProtocolStage::HttpProxyParse
  }
  fn consume(&mut self, buf: &mut BytesMut) -> Result<Transition<Request>> {
    match self.decoder.decode(buf) {
      Ok(Some(request)) => Ok(Transition::Emit(request)),
      Ok(None) if self.decoder.take_expect_continue() => {
        Ok(Transition::Reply(Bytes::from_static(CONTINUE)))
      }
      Ok(None) => Ok(Transition::Pending),
      Err(Error::MessageTooLarge(limit)) => {
        tracing::warn!("request exceeds {} bytes, rejecting", limit);
        Ok(Transition::Close(Some(Bytes::from_static(TOO_LARGE))))
      }
      Err(e) => Err(e),
    }
  }
}

/// `Proxy-Authorization: Basic` check answering failures with 407.
#[derive(Clone)]
pub struct ProxyAuthGate {
  authenticator: Arc<dyn Authenticator>,
  realm: String,
}

impl ProxyAuthGate {
  /// Gate checking against `authenticator`, challenging with `realm`.
  pub fn new(authenticator: Arc<dyn Authenticator>, realm: impl Into<String>) -> Self {
    Self {
      authenticator,
      realm: realm.into(),
    }
  }

  /// Whether `request` carries accepted credentials.
  pub fn admit(&self, request: &Request) -> bool {
    request
      .headers()
      .get(header::PROXY_AUTHORIZATION)
      .and_then(|value| decode_basic_auth(value.as_bytes()))
      .map(|(username, password)| self.authenticator.verify(&username, &password))
      .unwrap_or(false)
  }

  /// The 407 challenge.
  pub fn challenge(&self) -> Result<Response> {
    let response = Response::builder()
      .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
      .header(
        header::PROXY_AUTHENTICATE,
        format!("Basic realm=\"{}\"", self.realm),
      )
      .header(header::CONNECTION, "keep-alive")
      .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
      .header(header::CONTENT_LENGTH, "0")
      .body(Bytes::new())?;
    Ok(Response::from(response))
  }
}

/// Forged identities and the inspector for intercepted `CONNECT` tunnels.
pub struct Interception {
  authority: Arc<Authority>,
  cache: Arc<IdentityCache>,
  inspector: Arc<dyn Inspector>,
}

impl Interception {
  /// Intercept with leaves issued by `authority` and cached in `cache`.
  pub fn new(
    authority: Arc<Authority>,
    cache: Arc<IdentityCache>,
    inspector: Arc<dyn Inspector>,
  ) -> Self {
    Self {
      authority,
      cache,
      inspector,
    }
  }
}

/// Where a proxy request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
  /// host without brackets
  pub host: String,
  /// port, 80 when nothing names one
  pub port: u16,
}

impl ProxyTarget {
  /// Host from the `Host` header, falling back to the request-target authority.
  ///
  /// The port comes from the `Host` header, then the authority, then 80.
  pub fn from_request(request: &Request) -> Result<Self> {
    let uri_authority = request.uri().authority();
    let host_header = match request.headers().get(header::HOST) {
      Some(value) => {
        let value = value
          .to_str()
          .map_err(|_| Error::protocol("host header is not visible ascii"))?;
        Some(
          http::uri::Authority::from_str(value.trim())
            .map_err(|e| Error::protocol(format!("invalid host header {}: {}", value, e)))?,
        )
      }
      None => None,
    };
    let (host, port) = match (&host_header, uri_authority) {
      (Some(h), authority) => (
        h.host(),
        h.port_u16()
          .or_else(|| authority.and_then(|a| a.port_u16()))
          .unwrap_or(80),
      ),
      (None, Some(a)) => (a.host(), a.port_u16().unwrap_or(80)),
      (None, None) => return Err(Error::protocol("request names no host")),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
      return Err(Error::protocol("request names an empty host"));
    }
    Ok(Self {
      host: host.to_string(),
      port,
    })
  }
}

impl std::fmt::Display for ProxyTarget {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

/// Serves HTTP proxy connections. Shared by every connection of a listener;
/// per-connection state lives in the [`Pipeline`] and buffers of `handle`.
#[derive(Clone)]
pub struct HttpProxyHandler {
  connector: Connector,
  gate: Option<ProxyAuthGate>,
  inspector: Option<Arc<dyn Inspector>>,
  interception: Option<Arc<Interception>>,
  max_content_length: usize,
}

impl HttpProxyHandler {
  /// Handler dialing targets with `connector`.
  pub fn new(connector: Connector, max_content_length: usize) -> Self {
    Self {
      connector,
      gate: None,
      inspector: None,
      interception: None,
      max_content_length,
    }
  }
  /// Require proxy credentials.
  pub fn with_gate(mut self, gate: ProxyAuthGate) -> Self {
    self.gate = Some(gate);
    self
  }
  /// Show plain HTTP requests to `inspector`.
  pub fn with_inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
    self.inspector = Some(inspector);
    self
  }
  /// Intercept `CONNECT` tunnels.
  pub fn with_interception(mut self, interception: Arc<Interception>) -> Self {
    self.interception = Some(interception);
    self
  }

  /// Serve one client connection until it is routed or closes.
  pub async fn handle<S>(&self, mut stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut pipeline = Pipeline::new(
      [Layer::HttpServerCodec]
        .into_iter()
        .chain(self.gate.as_ref().map(|_| Layer::ProxyAuth))
        .chain([Layer::HttpProxy]),
    );
    let mut stage = HttpProxyParse::new(self.max_content_length);
    let mut buf = BytesMut::with_capacity(4096);
    loop {
      match stage.consume(&mut buf)? {
        Transition::Pending => {
          if stream.read_buf(&mut buf).await? == 0 {
            tracing::debug!("client closed before routing");
            return Ok(());
          }
        }
        Transition::Reply(bytes) => {
          stream.write_all(&bytes).await?;
          stream.flush().await?;
        }
        Transition::Close(last) => {
          if let Some(bytes) = last {
            stream.write_all(&bytes).await?;
          }
          stream.shutdown().await?;
          return Err(Error::MessageTooLarge(self.max_content_length));
        }
        Transition::Emit(request) => {
          if let Some(gate) = self.gate.as_ref().filter(|_| pipeline.contains(Layer::ProxyAuth)) {
            if !gate.admit(&request) {
              tracing::warn!("proxy authorization missing or rejected");
              stream.write_all(&gate.challenge()?.to_raw()).await?;
              stream.flush().await?;
              continue;
            }
            pipeline.remove(Layer::ProxyAuth);
          }
          tracing::debug!("routing through {:?}", pipeline.layers());
          return self.route(stream, request, buf).await;
        }
        other => {
          return Err(Error::StageTopology(format!(
            "{} cannot {:?} on the proxy front",
            stage.kind(),
            other
          )))
        }
      }
    }
  }

  async fn route<S>(&self, stream: S, request: Request, pending: BytesMut) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let target = ProxyTarget::from_request(&request)?;
    if request.method() != Method::CONNECT {
      return self.plain(stream, request, pending, target).await;
    }
    match &self.interception {
      Some(interception) => {
        self
          .intercept(stream, interception.clone(), pending, target)
          .await
      }
      None => self.tunnel(stream, pending, target).await,
    }
  }

  async fn plain<S>(
    &self,
    mut stream: S,
    request: Request,
    pending: BytesMut,
    target: ProxyTarget,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    if let Some(inspector) = &self.inspector {
      inspector.inspect(&request);
    }
    let mut outbound = match self.connector.connect(&target.host, target.port).await {
      Ok(outbound) => outbound,
      Err(e) => {
        let _ = stream.shutdown().await;
        return Err(e);
      }
    };
    outbound.write_all(&request.to_raw()).await?;
    outbound.flush().await?;
    tracing::debug!("{} {} relayed to {}", request.method(), request.uri(), target);
    ConnectionPair::new(stream, outbound)
      .with_client_buffer(pending)
      .relay()
      .await
  }

  async fn tunnel<S>(&self, mut stream: S, pending: BytesMut, target: ProxyTarget) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let outbound = match self.connector.connect(&target.host, target.port).await {
      Ok(outbound) => outbound,
      Err(e) => {
        let _ = stream.shutdown().await;
        return Err(e);
      }
    };
    stream.write_all(CONNECT_ESTABLISHED).await?;
    stream.flush().await?;
    tracing::info!("tunnel to {}", target);
    ConnectionPair::new(stream, outbound)
      .with_client_buffer(pending)
      .relay()
      .await
  }

  async fn intercept<S>(
    &self,
    mut stream: S,
    interception: Arc<Interception>,
    pending: BytesMut,
    target: ProxyTarget,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let leaf = {
      let cache = interception.cache.clone();
      let host = target.host.clone();
      let port = target.port;
      tokio::task::spawn_blocking(move || cache.get_or_create(&host, port))
        .await
        .map_err(|e| Error::certificate_generation(format!("issuance task failed: {}", e)))
        .and_then(|leaf| leaf)
    };
    let acceptor = match leaf.and_then(|leaf| tls::acceptor(&leaf, Some(interception.authority.root()))) {
      Ok(acceptor) => acceptor,
      Err(e) => {
        let _ = stream.shutdown().await;
        return Err(e);
      }
    };
    let outbound = match self.connector.connect_tls(&target.host, target.port).await {
      Ok(outbound) => outbound,
      Err(e) => {
        let _ = stream.shutdown().await;
        return Err(e);
      }
    };
    stream.write_all(CONNECT_ESTABLISHED).await?;
    stream.flush().await?;
    let client = acceptor.accept(Rewind::new(stream, pending.freeze())).await?;
    tracing::info!("intercepting {}", target);
    ConnectionPair::new(client, outbound)
      .capture(
        Some(interception.inspector.clone()),
        self.max_content_length,
      )
      .await
  }
}
