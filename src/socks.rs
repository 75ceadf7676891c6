//! SOCKS4a and SOCKS5 front.
//!
//! The handshake is a chain of stages: [`SocksGreeting`], then
//! [`SocksAuth`] when an authenticator is configured, then [`SocksCommand`].
//! The last stage emits a [`SocksConnect`] which the driver turns into an
//! outbound connection and a raw relay.
use crate::auth::Authenticator;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::relay::ConnectionPair;
use crate::stage::{ProtocolStage, Stage, Transition};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS4 user id and domain fields are NUL terminated; anything longer than
/// this without a terminator is not a handshake.
const MAX_SOCKS4_FIELD: usize = 1024;

/// Protocol version a client spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
  /// SOCKS4 or SOCKS4a
  V4,
  /// SOCKS5
  V5,
}

/// Requested destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 or IPv6 literal
  Ip(SocketAddr),
  /// Domain name resolved by the proxy
  Domain(String, u16),
}

impl TargetAddr {
  /// Host without port, IPv6 literals unbracketed.
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ip(addr) => addr.ip().to_string(),
      TargetAddr::Domain(domain, _) => domain.clone(),
    }
  }
  /// Destination port.
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ip(addr) => addr.port(),
      TargetAddr::Domain(_, port) => *port,
    }
  }
  /// SOCKS5 `ATYP | ADDR | PORT` encoding.
  fn put_socks5(&self, packet: &mut BytesMut) {
    match self {
      TargetAddr::Ip(SocketAddr::V4(addr)) => {
        packet.put_u8(consts::SOCKS5_ADDR_TYPE_IPV4);
        packet.put_slice(&addr.ip().octets());
        packet.put_u16(addr.port());
      }
      TargetAddr::Ip(SocketAddr::V6(addr)) => {
        packet.put_u8(consts::SOCKS5_ADDR_TYPE_IPV6);
        packet.put_slice(&addr.ip().octets());
        packet.put_u16(addr.port());
      }
      TargetAddr::Domain(domain, port) => {
        packet.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
        // parsed from a one byte length, never longer than 255
        packet.put_u8(domain.len() as u8);
        packet.put_slice(domain.as_bytes());
        packet.put_u16(*port);
      }
    }
  }
}

impl std::fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TargetAddr::Ip(addr) => write!(f, "{}", addr),
      TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
    }
  }
}

/// A validated CONNECT request, handed from the handshake to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksConnect {
  /// version the reply must be written in
  pub version: SocksVersion,
  /// where to connect
  pub target: TargetAddr,
}

impl SocksConnect {
  /// Reply written once the outbound connection is established.
  pub fn success_reply(&self) -> Bytes {
    match self.version {
      SocksVersion::V4 => Bytes::from_static(&[0x00, consts::SOCKS4_REPLY_GRANTED, 0, 0, 0, 0, 0, 0]),
      SocksVersion::V5 => self.socks5_reply(consts::SOCKS5_REPLY_SUCCEEDED),
    }
  }
  /// Reply written when the outbound connection fails.
  pub fn failure_reply(&self) -> Bytes {
    match self.version {
      SocksVersion::V4 => Bytes::from_static(&[0x00, consts::SOCKS4_REPLY_REJECTED, 0, 0, 0, 0, 0, 0]),
      SocksVersion::V5 => self.socks5_reply(consts::SOCKS5_REPLY_GENERAL_FAILURE),
    }
  }
  fn socks5_reply(&self, reply: u8) -> Bytes {
    let mut packet = BytesMut::with_capacity(consts::MAX_ADDR_LEN + 3);
    packet.put_slice(&[consts::SOCKS5_VERSION, reply, 0x00]);
    self.target.put_socks5(&mut packet);
    packet.freeze()
  }
}

type SocksTransition = Transition<SocksConnect>;

/// First message on a SOCKS connection: SOCKS4a request or SOCKS5 method selection.
pub struct SocksGreeting {
  authenticator: Option<Arc<dyn Authenticator>>,
}

impl SocksGreeting {
  /// Greeting stage; password mode is on when `authenticator` is set.
  pub fn new(authenticator: Option<Arc<dyn Authenticator>>) -> Self {
    Self { authenticator }
  }
}

impl Stage for SocksGreeting {
  type Event = SocksConnect;
  fn kind(&self) -> ProtocolStage {
    ProtocolStage::SocksGreeting
  }
  fn consume(&mut self, buf: &mut BytesMut) -> Result<SocksTransition> {
    match buf.first().copied() {
      None => Ok(Transition::Pending),
      Some(consts::SOCKS4_VERSION) => {
        let Some(connect) = parse_socks4(buf)? else {
          return Ok(Transition::Pending);
        };
        if self.authenticator.is_some() {
          return Err(Error::AuthFailure(
            "socks4a has no password exchange".to_string(),
          ));
        }
        Ok(Transition::Emit(connect))
      }
      Some(consts::SOCKS5_VERSION) => {
        if buf.len() < 2 {
          return Ok(Transition::Pending);
        }
        let methods = buf[1] as usize;
        if buf.len() < 2 + methods {
          return Ok(Transition::Pending);
        }
        buf.advance(2 + methods);
        // the method is advertised whatever the client offered
        match &self.authenticator {
          Some(authenticator) => Ok(Transition::Replace {
            next: Box::new(SocksAuth::new(authenticator.clone())),
            reply: Some(Bytes::from_static(&[
              consts::SOCKS5_VERSION,
              consts::SOCKS5_AUTH_METHOD_PASSWORD,
            ])),
          }),
          None => Ok(Transition::Replace {
            next: Box::new(SocksCommand),
            reply: Some(Bytes::from_static(&[
              consts::SOCKS5_VERSION,
              consts::SOCKS5_AUTH_METHOD_NONE,
            ])),
          }),
        }
      }
      Some(version) => Err(Error::protocol(format!(
        "unknown socks version {:#04x}",
        version
      ))),
    }
  }
}

/// RFC1929 username/password sub-negotiation.
pub struct SocksAuth {
  authenticator: Arc<dyn Authenticator>,
}

impl SocksAuth {
  /// Check credentials against `authenticator`.
  pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
    Self { authenticator }
  }
}

impl Stage for SocksAuth {
  type Event = SocksConnect;
  fn kind(&self) -> ProtocolStage {
    ProtocolStage::SocksAuth
  }
  fn consume(&mut self, buf: &mut BytesMut) -> Result<SocksTransition> {
    if buf.is_empty() {
      return Ok(Transition::Pending);
    }
    if buf[0] != consts::SOCKS5_AUTH_VERSION {
      return Err(Error::protocol(format!(
        "expected password auth, got version {:#04x}",
        buf[0]
      )));
    }
    let Some(user_len) = buf.get(1).map(|l| *l as usize) else {
      return Ok(Transition::Pending);
    };
    let Some(pass_len) = buf.get(2 + user_len).map(|l| *l as usize) else {
      return Ok(Transition::Pending);
    };
    let total = 3 + user_len + pass_len;
    if buf.len() < total {
      return Ok(Transition::Pending);
    }
    let message = buf.split_to(total);
    let username = String::from_utf8_lossy(&message[2..2 + user_len]);
    let password = String::from_utf8_lossy(&message[3 + user_len..total]);
    if self.authenticator.verify(&username, &password) {
      tracing::debug!("socks user {} authenticated", username);
      Ok(Transition::Replace {
        next: Box::new(SocksCommand),
        reply: Some(Bytes::from_static(&[
          consts::SOCKS5_AUTH_VERSION,
          consts::SOCKS5_AUTH_SUCCEEDED,
        ])),
      })
    } else {
      tracing::warn!("socks authentication failed for user {}", username);
      Ok(Transition::Close(Some(Bytes::from_static(&[
        consts::SOCKS5_AUTH_VERSION,
        consts::SOCKS5_AUTH_FAILED,
      ]))))
    }
  }
}

/// SOCKS5 command request. Only CONNECT is served.
pub struct SocksCommand;

impl Stage for SocksCommand {
  type Event = SocksConnect;
  fn kind(&self) -> ProtocolStage {
    ProtocolStage::SocksCommand
  }
  fn consume(&mut self, buf: &mut BytesMut) -> Result<SocksTransition> {
    if buf.len() < 4 {
      return Ok(Transition::Pending);
    }
    let [version, cmd, _rsv, address_type] = [buf[0], buf[1], buf[2], buf[3]];
    if version != consts::SOCKS5_VERSION {
      return Err(Error::protocol(format!(
        "command with socks version {:#04x}",
        version
      )));
    }
    if cmd != consts::SOCKS5_CMD_TCP_CONNECT {
      return Err(Error::protocol(format!("unsupported socks5 command {:#04x}", cmd)));
    }
    let (address_len, target) = match address_type {
      consts::SOCKS5_ADDR_TYPE_IPV4 => {
        if buf.len() < 10 {
          return Ok(Transition::Pending);
        }
        let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
        let port = u16::from_be_bytes([buf[8], buf[9]]);
        (10, TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))))
      }
      consts::SOCKS5_ADDR_TYPE_IPV6 => {
        if buf.len() < 22 {
          return Ok(Transition::Pending);
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&buf[4..20]);
        let port = u16::from_be_bytes([buf[20], buf[21]]);
        (
          22,
          TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::from(octets),
            port,
            0,
            0,
          ))),
        )
      }
      consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
        let Some(len) = buf.get(4).map(|l| *l as usize) else {
          return Ok(Transition::Pending);
        };
        let total = 5 + len + 2;
        if buf.len() < total {
          return Ok(Transition::Pending);
        }
        let domain = std::str::from_utf8(&buf[5..5 + len])
          .map_err(|_| Error::protocol("domain is not utf-8"))?
          .to_string();
        let port = u16::from_be_bytes([buf[5 + len], buf[6 + len]]);
        (total, TargetAddr::Domain(domain, port))
      }
      other => {
        return Err(Error::protocol(format!(
          "unsupported address type {:#04x}",
          other
        )))
      }
    };
    buf.advance(address_len);
    Ok(Transition::Emit(SocksConnect {
      version: SocksVersion::V5,
      target,
    }))
  }
}

/// `VN CD DSTPORT DSTIP USERID NUL [DOMAIN NUL]`
fn parse_socks4(buf: &mut BytesMut) -> Result<Option<SocksConnect>> {
  if buf.len() < 8 {
    return Ok(None);
  }
  let cmd = buf[1];
  if cmd != consts::SOCKS4_CMD_CONNECT {
    return Err(Error::protocol(format!("unsupported socks4 command {:#04x}", cmd)));
  }
  let port = u16::from_be_bytes([buf[2], buf[3]]);
  let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
  let Some(user_end) = find_nul(&buf[8..])? else {
    return Ok(None);
  };
  let mut consumed = 8 + user_end + 1;
  // 0.0.0.x with x != 0 means a domain follows the user id
  let octets = ip.octets();
  let target = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
    let Some(domain_end) = find_nul(&buf[consumed..])? else {
      return Ok(None);
    };
    let domain = std::str::from_utf8(&buf[consumed..consumed + domain_end])
      .map_err(|_| Error::protocol("domain is not utf-8"))?
      .to_string();
    consumed += domain_end + 1;
    TargetAddr::Domain(domain, port)
  } else {
    TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port)))
  };
  buf.advance(consumed);
  Ok(Some(SocksConnect {
    version: SocksVersion::V4,
    target,
  }))
}

fn find_nul(field: &[u8]) -> Result<Option<usize>> {
  match field.iter().position(|b| *b == 0) {
    Some(index) => Ok(Some(index)),
    None if field.len() > MAX_SOCKS4_FIELD => Err(Error::protocol("socks4 field is not terminated")),
    None => Ok(None),
  }
}

/// Serves SOCKS connections. Holds no per-connection state, so one handler
/// is shared by every connection of a listener.
#[derive(Clone)]
pub struct SocksHandler {
  authenticator: Option<Arc<dyn Authenticator>>,
  connector: Connector,
}

impl SocksHandler {
  /// Handler dialing targets with `connector`.
  pub fn new(connector: Connector, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
    Self {
      authenticator,
      connector,
    }
  }

  /// Run the handshake on `stream`, then relay it to the requested target.
  pub async fn handle<S>(&self, mut stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut stage: Box<dyn Stage<Event = SocksConnect>> =
      Box::new(SocksGreeting::new(self.authenticator.clone()));
    let mut buf = BytesMut::with_capacity(512);
    loop {
      loop {
        match stage.consume(&mut buf)? {
          Transition::Pending => break,
          Transition::Reply(bytes) => stream.write_all(&bytes).await?,
          Transition::Replace { next, reply } => {
            if let Some(bytes) = reply {
              stream.write_all(&bytes).await?;
            }
            tracing::debug!("{} -> {}", stage.kind(), next.kind());
            stage = next;
          }
          Transition::Emit(connect) => return self.connect(stream, connect, buf).await,
          Transition::Close(last) => {
            if let Some(bytes) = last {
              stream.write_all(&bytes).await?;
            }
            stream.shutdown().await?;
            return Err(Error::AuthFailure("socks credentials rejected".to_string()));
          }
          other => {
            return Err(Error::StageTopology(format!(
              "{} cannot {:?} during a handshake",
              stage.kind(),
              other
            )))
          }
        }
      }
      if stream.read_buf(&mut buf).await? == 0 {
        tracing::debug!("client closed during {}", stage.kind());
        return Ok(());
      }
    }
  }

  async fn connect<S>(&self, mut stream: S, connect: SocksConnect, pending: BytesMut) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let host = connect.target.host();
    let port = connect.target.port();
    match self.connector.connect(&host, port).await {
      Ok(target) => {
        stream.write_all(&connect.success_reply()).await?;
        stream.flush().await?;
        tracing::info!("socks {:?} tunnel to {}", connect.version, connect.target);
        ConnectionPair::new(stream, target)
          .with_client_buffer(pending)
          .relay()
          .await
      }
      Err(e) => {
        let _ = stream.write_all(&connect.failure_reply()).await;
        let _ = stream.shutdown().await;
        Err(e)
      }
    }
  }
}

#[rustfmt::skip]
pub mod consts {
  //! SOCKS wire constants.
  #![allow(missing_docs)]
  pub const MAX_ADDR_LEN: usize = 260;

  pub const SOCKS4_VERSION: u8 = 0x04;
  pub const SOCKS4_CMD_CONNECT: u8 = 0x01;
  pub const SOCKS4_REPLY_GRANTED: u8 = 0x5a;
  pub const SOCKS4_REPLY_REJECTED: u8 = 0x5b;

  pub const SOCKS5_VERSION: u8 = 0x05;

  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
  pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;

  pub const SOCKS5_AUTH_VERSION: u8 = 0x01;
  pub const SOCKS5_AUTH_SUCCEEDED: u8 = 0x00;
  pub const SOCKS5_AUTH_FAILED: u8 = 0x01;

  pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
  // pub const SOCKS5_CMD_TCP_BIND: u8 = 0x02;
  // pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
  pub const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::StaticCredentials;

  fn aa() -> Option<Arc<dyn Authenticator>> {
    Some(Arc::new(StaticCredentials::new("aa", "aa")))
  }

  fn replace<E: 'static>(t: Transition<E>) -> (Box<dyn Stage<Event = E>>, Option<Bytes>) {
    match t {
      Transition::Replace { next, reply } => (next, reply),
      other => panic!("expected replace, got {:?}", other),
    }
  }

  #[test]
  fn socks5_without_auth_goes_straight_to_command() {
    let mut greeting = SocksGreeting::new(None);
    let mut buf = BytesMut::from(&[5u8, 1][..]);
    assert!(matches!(greeting.consume(&mut buf).unwrap(), Transition::Pending));
    buf.put_u8(0);
    let (next, reply) = replace(greeting.consume(&mut buf).unwrap());
    assert_eq!(next.kind(), ProtocolStage::SocksCommand);
    assert_eq!(reply.unwrap().as_ref(), &[5, 0]);
    assert!(buf.is_empty());
  }

  #[test]
  fn password_mode_is_advertised_regardless_of_offer() {
    let mut greeting = SocksGreeting::new(aa());
    let mut buf = BytesMut::from(&[5u8, 1, 0][..]);
    let (next, reply) = replace(greeting.consume(&mut buf).unwrap());
    assert_eq!(next.kind(), ProtocolStage::SocksAuth);
    assert_eq!(reply.unwrap().as_ref(), &[5, 2]);
  }

  #[test]
  fn wrong_password_replies_failure_and_closes() {
    let mut auth = SocksAuth::new(Arc::new(StaticCredentials::new("aa", "aa")));
    let mut buf = BytesMut::from(&[1u8, 2, b'b', b'b', 2, b'b', b'b'][..]);
    match auth.consume(&mut buf).unwrap() {
      Transition::Close(Some(reply)) => assert_eq!(reply.as_ref(), &[1, 1]),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn right_password_moves_to_command() {
    let mut auth = SocksAuth::new(Arc::new(StaticCredentials::new("aa", "aa")));
    let mut buf = BytesMut::from(&[1u8, 2, b'a', b'a', 2, b'a'][..]);
    assert!(matches!(auth.consume(&mut buf).unwrap(), Transition::Pending));
    buf.put_u8(b'a');
    let (next, reply) = replace(auth.consume(&mut buf).unwrap());
    assert_eq!(next.kind(), ProtocolStage::SocksCommand);
    assert_eq!(reply.unwrap().as_ref(), &[1, 0]);
  }

  #[test]
  fn command_parses_domain_and_keeps_trailing_bytes() {
    let mut command = SocksCommand;
    let mut buf = BytesMut::from(&[5u8, 1, 0, 3, 11][..]);
    buf.put_slice(b"example.com");
    buf.put_u16(443);
    buf.put_slice(b"early");
    match command.consume(&mut buf).unwrap() {
      Transition::Emit(connect) => {
        assert_eq!(connect.version, SocksVersion::V5);
        assert_eq!(connect.target, TargetAddr::Domain("example.com".to_string(), 443));
        let reply = connect.success_reply();
        assert_eq!(&reply[..5], &[5, 0, 0, 3, 11]);
        assert_eq!(&reply[reply.len() - 2..], &443u16.to_be_bytes());
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(&buf[..], b"early");
  }

  #[test]
  fn bind_and_udp_are_rejected() {
    for cmd in [2u8, 3] {
      let mut buf = BytesMut::from(&[5u8, cmd, 0, 1, 127, 0, 0, 1, 0, 80][..]);
      assert!(matches!(
        SocksCommand.consume(&mut buf),
        Err(Error::ProtocolViolation(_))
      ));
    }
  }

  #[test]
  fn socks4a_connect_with_domain() {
    let mut greeting = SocksGreeting::new(None);
    let mut buf = BytesMut::from(&[4u8, 1, 0x1f, 0x90, 0, 0, 0, 1][..]);
    buf.put_slice(b"user\0");
    assert!(matches!(greeting.consume(&mut buf).unwrap(), Transition::Pending));
    buf.put_slice(b"test.local\0");
    match greeting.consume(&mut buf).unwrap() {
      Transition::Emit(connect) => {
        assert_eq!(connect.version, SocksVersion::V4);
        assert_eq!(connect.target, TargetAddr::Domain("test.local".to_string(), 8080));
        assert_eq!(connect.success_reply().as_ref(), &[0, 0x5a, 0, 0, 0, 0, 0, 0]);
        assert_eq!(connect.failure_reply()[1], 0x5b);
      }
      other => panic!("unexpected {:?}", other),
    }
    assert!(buf.is_empty());
  }

  #[test]
  fn socks4_rejected_in_password_mode_and_for_bind() {
    let mut buf = BytesMut::from(&[4u8, 1, 0, 80, 127, 0, 0, 1, 0][..]);
    assert!(matches!(
      SocksGreeting::new(aa()).consume(&mut buf),
      Err(Error::AuthFailure(_))
    ));
    let mut buf = BytesMut::from(&[4u8, 2, 0, 80, 127, 0, 0, 1, 0][..]);
    assert!(matches!(
      SocksGreeting::new(None).consume(&mut buf),
      Err(Error::ProtocolViolation(_))
    ));
  }

  #[test]
  fn unknown_version_is_a_violation() {
    let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
    assert!(matches!(
      SocksGreeting::new(None).consume(&mut buf),
      Err(Error::ProtocolViolation(_))
    ));
  }
}
