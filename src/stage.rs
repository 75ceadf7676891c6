//! Per-connection protocol stages.
//!
//! A connection has exactly one active [`Stage`] consuming its inbound bytes.
//! Switching protocols replaces the active stage; the [`Pipeline`] records
//! which layers an HTTP proxy connection carries until it is routed.
use crate::errors::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::fmt;

/// What the bytes on a connection are currently interpreted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolStage {
  /// SOCKS method negotiation.
  SocksGreeting,
  /// RFC1929 username/password exchange.
  SocksAuth,
  /// SOCKS command request.
  SocksCommand,
  /// Aggregated HTTP proxy requests.
  HttpProxyParse,
  /// Opaque bytes forwarded to the peer.
  RawRelay,
  /// Decoded HTTP messages forwarded to the peer, requests tapped.
  CapturingRelay,
}

impl fmt::Display for ProtocolStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ProtocolStage::SocksGreeting => "socks-greeting",
      ProtocolStage::SocksAuth => "socks-auth",
      ProtocolStage::SocksCommand => "socks-command",
      ProtocolStage::HttpProxyParse => "http-proxy-parse",
      ProtocolStage::RawRelay => "raw-relay",
      ProtocolStage::CapturingRelay => "capturing-relay",
    };
    f.write_str(name)
  }
}

/// Result of feeding buffered bytes to a stage.
pub enum Transition<E> {
  /// More bytes are needed.
  Pending,
  /// Write these bytes back to the connection the stage reads from.
  Reply(Bytes),
  /// Forward these bytes to the paired connection.
  Forward(Bytes),
  /// Write the reply, if any, then make `next` the active stage.
  Replace {
    /// stage taking over the connection
    next: Box<dyn Stage<Event = E>>,
    /// bytes to send before switching
    reply: Option<Bytes>,
  },
  /// Hand a decoded event to the connection driver.
  Emit(E),
  /// Write the bytes, if any, then close the connection.
  Close(Option<Bytes>),
}

impl<E> fmt::Debug for Transition<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Transition::Pending => f.write_str("Pending"),
      Transition::Reply(b) => write!(f, "Reply({} bytes)", b.len()),
      Transition::Forward(b) => write!(f, "Forward({} bytes)", b.len()),
      Transition::Replace { next, .. } => write!(f, "Replace({})", (**next).kind()),
      Transition::Emit(_) => f.write_str("Emit"),
      Transition::Close(_) => f.write_str("Close"),
    }
  }
}

/// Logic consuming a connection's inbound bytes.
///
/// `consume` takes what it understands off the front of `buf` and reports one
/// transition per call; the driver calls it again until it returns
/// [`Transition::Pending`].
pub trait Stage: Send {
  /// Event handed to the driver through [`Transition::Emit`].
  type Event;
  /// Which protocol this stage speaks.
  fn kind(&self) -> ProtocolStage;
  /// Consume buffered bytes.
  fn consume(&mut self, buf: &mut BytesMut) -> Result<Transition<Self::Event>>;
  /// The connection reached end of stream; flush whatever is still buffered.
  fn consume_eof(&mut self, buf: &mut BytesMut) -> Result<Transition<Self::Event>> {
    let _ = buf;
    Ok(Transition::Close(None))
  }
  /// The connection is closing.
  fn on_close(&mut self) {}
}

impl<E: 'static> Stage for Box<dyn Stage<Event = E>> {
  type Event = E;
  fn kind(&self) -> ProtocolStage {
    (**self).kind()
  }
  fn consume(&mut self, buf: &mut BytesMut) -> Result<Transition<E>> {
    (**self).consume(buf)
  }
  fn consume_eof(&mut self, buf: &mut BytesMut) -> Result<Transition<E>> {
    (**self).consume_eof(buf)
  }
  fn on_close(&mut self) {
    (**self).on_close()
  }
}

/// Processing layers an HTTP proxy connection carries before it is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
  /// HTTP/1.x server codec with aggregation.
  HttpServerCodec,
  /// Proxy-Authorization gate, dropped after the first admitted request.
  ProxyAuth,
  /// HTTP proxy request routing.
  HttpProxy,
}

/// Ordered set of layers on one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
  layers: Vec<Layer>,
}

impl Pipeline {
  /// Pipeline holding `layers` in order.
  pub fn new(layers: impl IntoIterator<Item = Layer>) -> Self {
    Self {
      layers: layers.into_iter().collect(),
    }
  }
  /// Whether `layer` is present.
  pub fn contains(&self, layer: Layer) -> bool {
    self.layers.contains(&layer)
  }
  /// Remove `layer` if present. Returns whether anything was removed.
  pub fn remove(&mut self, layer: Layer) -> bool {
    match self.layers.iter().position(|l| *l == layer) {
      Some(index) => {
        self.layers.remove(index);
        true
      }
      None => {
        tracing::debug!("{}", Error::StageTopology(format!("{:?} not present", layer)));
        false
      }
    }
  }
  /// Layers in order.
  pub fn layers(&self) -> &[Layer] {
    &self.layers
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remove_is_check_then_remove() {
    let mut pipeline = Pipeline::new([Layer::HttpServerCodec, Layer::ProxyAuth, Layer::HttpProxy]);
    assert!(pipeline.remove(Layer::ProxyAuth));
    assert!(!pipeline.remove(Layer::ProxyAuth));
    assert!(!pipeline.contains(Layer::ProxyAuth));
    assert_eq!(pipeline.layers(), &[Layer::HttpServerCodec, Layer::HttpProxy]);
  }
}
