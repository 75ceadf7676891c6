//! Forwarding between a client connection and its target.
use crate::codec::{MethodQueue, RequestDecoder, ResponseDecoder};
use crate::errors::{Error, Result};
use crate::inspect::Inspector;
use crate::stage::{ProtocolStage, Stage, Transition};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

const READ_CHUNK: usize = 16 * 1024;

/// Forwards every byte verbatim.
#[derive(Debug, Default)]
pub struct RawRelay;

impl Stage for RawRelay {
  type Event = Infallible;
  fn kind(&self) -> ProtocolStage {
    ProtocolStage::RawRelay
  }
  fn consume(&mut self, buf: &mut BytesMut) -> Result<Transition<Infallible>> {
    if buf.is_empty() {
      return Ok(Transition::Pending);
    }
    Ok(Transition::Forward(buf.split().freeze()))
  }
  fn consume_eof(&mut self, buf: &mut BytesMut) -> Result<Transition<Infallible>> {
    if buf.is_empty() {
      return Ok(Transition::Close(None));
    }
    Ok(Transition::Close(Some(buf.split().freeze())))
  }
}

enum Capture {
  Requests {
    decoder: RequestDecoder,
    inspector: Option<Arc<dyn Inspector>>,
    methods: MethodQueue,
  },
  Responses(ResponseDecoder),
}

/// Forwards decoded HTTP messages, handing each request to an inspector first.
pub struct CapturingRelay {
  capture: Capture,
}

impl CapturingRelay {
  /// Client to target direction: decodes requests and taps them.
  pub fn requests(
    max_content_length: usize,
    inspector: Option<Arc<dyn Inspector>>,
    methods: MethodQueue,
  ) -> Self {
    Self {
      capture: Capture::Requests {
        decoder: RequestDecoder::new(max_content_length),
        inspector,
        methods,
      },
    }
  }
  /// Target to client direction: decodes responses and forwards them.
  pub fn responses(max_content_length: usize, methods: MethodQueue) -> Self {
    Self {
      capture: Capture::Responses(ResponseDecoder::new(max_content_length, methods)),
    }
  }
}

impl Stage for CapturingRelay {
  type Event = Infallible;
  fn kind(&self) -> ProtocolStage {
    ProtocolStage::CapturingRelay
  }
  fn consume(&mut self, buf: &mut BytesMut) -> Result<Transition<Infallible>> {
    match &mut self.capture {
      Capture::Requests {
        decoder,
        inspector,
        methods,
      } => match decoder.decode(buf)? {
        Some(request) => {
          if let Some(inspector) = inspector {
            inspector.inspect(&request);
          }
          methods.lock().push_back(request.method().clone());
          Ok(Transition::Forward(request.to_raw()))
        }
        None => Ok(Transition::Pending),
      },
      Capture::Responses(decoder) => match decoder.decode(buf)? {
        Some(response) => Ok(Transition::Forward(response.to_raw())),
        None => Ok(Transition::Pending),
      },
    }
  }
  fn consume_eof(&mut self, buf: &mut BytesMut) -> Result<Transition<Infallible>> {
    match &mut self.capture {
      Capture::Requests { decoder, .. } => {
        if !decoder.is_idle() {
          tracing::debug!("client closed inside a request, dropping it");
        }
        Ok(Transition::Close(None))
      }
      Capture::Responses(decoder) => match decoder.decode_eof(buf)? {
        Some(response) => Ok(Transition::Close(Some(response.to_raw()))),
        None => Ok(Transition::Close(None)),
      },
    }
  }
}

/// A client connection and its outbound connection, closed together.
pub struct ConnectionPair<C, T> {
  client: C,
  client_buf: BytesMut,
  target: T,
  target_buf: BytesMut,
}

impl<C, T> ConnectionPair<C, T>
where
  C: AsyncRead + AsyncWrite + Unpin,
  T: AsyncRead + AsyncWrite + Unpin,
{
  /// Pair `client` with `target`.
  pub fn new(client: C, target: T) -> Self {
    Self {
      client,
      client_buf: BytesMut::new(),
      target,
      target_buf: BytesMut::new(),
    }
  }

  /// Bytes already read from the client that must reach the target first.
  pub fn with_client_buffer(mut self, buf: BytesMut) -> Self {
    self.client_buf = buf;
    self
  }

  /// Opaque relay in both directions.
  pub async fn relay(self) -> Result<()> {
    self.run(RawRelay, RawRelay).await
  }

  /// Decoded relay: requests are tapped by `inspector` before forwarding.
  pub async fn capture(
    self,
    inspector: Option<Arc<dyn Inspector>>,
    max_content_length: usize,
  ) -> Result<()> {
    let methods: MethodQueue = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
    let upstream = CapturingRelay::requests(max_content_length, inspector, methods.clone());
    let downstream = CapturingRelay::responses(max_content_length, methods);
    self.run(upstream, downstream).await
  }

  /// Drive both directions on the current task until either side closes.
  pub async fn run<U, D>(self, upstream: U, downstream: D) -> Result<()>
  where
    U: Stage<Event = Infallible>,
    D: Stage<Event = Infallible>,
  {
    let (client_r, client_w) = tokio::io::split(self.client);
    let (target_r, target_w) = tokio::io::split(self.target);
    let closing = Notify::new();
    let (up, down) = tokio::join!(
      pump(client_r, target_w, upstream, self.client_buf, &closing, "client"),
      pump(target_r, client_w, downstream, self.target_buf, &closing, "target"),
    );
    up.and(down)
  }
}

/// Move data from `reader` through `stage` into `writer`.
///
/// When this direction ends, the writer is shut down and the opposite
/// direction is told to stop at its next read.
async fn pump<R, W, S>(
  mut reader: R,
  mut writer: W,
  mut stage: S,
  mut buf: BytesMut,
  closing: &Notify,
  side: &str,
) -> Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
  S: Stage<Event = Infallible>,
{
  let result: Result<()> = async {
    loop {
      loop {
        match stage.consume(&mut buf)? {
          Transition::Pending => break,
          Transition::Forward(bytes) => {
            if !forward(&mut writer, &bytes).await {
              return Ok(());
            }
          }
          Transition::Close(last) => {
            if let Some(bytes) = last {
              forward(&mut writer, &bytes).await;
            }
            return Ok(());
          }
          Transition::Emit(never) => match never {},
          other => {
            return Err(Error::StageTopology(format!(
              "{} cannot {:?} while relaying",
              stage.kind(),
              other
            )))
          }
        }
      }
      buf.reserve(READ_CHUNK);
      let n = tokio::select! {
        n = reader.read_buf(&mut buf) => n?,
        _ = closing.notified() => return Ok(()),
      };
      if n == 0 {
        tracing::debug!("{} side reached end of stream", side);
        match stage.consume_eof(&mut buf)? {
          Transition::Forward(bytes) | Transition::Close(Some(bytes)) => {
            forward(&mut writer, &bytes).await;
          }
          _ => {}
        }
        return Ok(());
      }
    }
  }
  .await;
  if let Err(e) = &result {
    if e.is_disconnect() {
      tracing::debug!("{} side disconnected: {}", side, e);
    } else {
      tracing::warn!("relay from {} side failed: {}", side, e);
    }
  }
  stage.on_close();
  let _ = writer.shutdown().await;
  closing.notify_one();
  result
}

/// Write and flush. A peer that is gone drops the data silently.
async fn forward<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> bool {
  let written = async {
    writer.write_all(bytes).await?;
    writer.flush().await
  }
  .await;
  match written {
    Ok(()) => true,
    Err(e) => {
      tracing::debug!("peer is gone, dropping {} bytes: {}", bytes.len(), e);
      false
    }
  }
}
