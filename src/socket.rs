use bytes::{Buf, Bytes};
use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream that first yields bytes read ahead by a previous stage.
///
/// Used when a connection switches protocol (for example to TLS) while the
/// previous stage already pulled some of the next protocol's bytes.
#[derive(Debug)]
pub struct Rewind<S> {
  prefix: Option<Bytes>,
  inner: S,
}

impl<S> Rewind<S> {
  /// Replay `prefix` before reading from `inner`.
  pub fn new(inner: S, prefix: Bytes) -> Self {
    Self {
      prefix: if prefix.is_empty() { None } else { Some(prefix) },
      inner,
    }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if let Some(mut prefix) = self.prefix.take() {
      if buf.remaining() > 0 {
        let n = prefix.len().min(buf.remaining());
        buf.put_slice(&prefix[..n]);
        prefix.advance(n);
      }
      if !prefix.is_empty() {
        self.prefix = Some(prefix);
      }
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
