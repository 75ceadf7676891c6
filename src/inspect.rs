//! Hook for observing intercepted requests.
use crate::message::Request;

/// Receives every request the proxy decodes on an inspected connection.
///
/// Called on the connection's task before the request is forwarded, so a slow
/// inspector delays that connection only.
pub trait Inspector: Send + Sync {
  /// Observe `request`. The proxy forwards it unchanged afterwards.
  fn inspect(&self, request: &Request);
}

impl<F> Inspector for F
where
  F: Fn(&Request) + Send + Sync,
{
  fn inspect(&self, request: &Request) {
    self(request)
  }
}

/// Inspector that logs each request line through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInspector;

impl Inspector for LoggingInspector {
  fn inspect(&self, request: &Request) {
    tracing::info!(
      "{} {} {:?} ({} body bytes)",
      request.method(),
      request.uri(),
      request.version(),
      request.body().len()
    );
  }
}
