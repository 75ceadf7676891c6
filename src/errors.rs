//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `sokcs::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while serving a proxied connection.
///
/// Every failure is handled at the connection boundary: the owning connection
/// closes, siblings and the listener keep running.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Unsupported protocol version or command, or a malformed handshake.
  #[error("protocol violation: {0}")]
  ProtocolViolation(String),
  /// Bad proxy credentials.
  #[error("authentication failed: {0}")]
  AuthFailure(String),
  /// The key algorithm or crypto provider could not be resolved.
  #[error("crypto unavailable: {0}")]
  CryptoUnavailable(String),
  /// Encoding or signing a certificate failed.
  #[error("certificate build failure: {0}")]
  CertificateBuild(String),
  /// The identity cache could not produce a leaf for a host.
  #[error("certificate generation failure: {0}")]
  CertificateGeneration(String),
  /// Target unreachable or the connect attempt timed out.
  #[error("outbound connect to {target} failed: {source}")]
  OutboundConnect {
    /// `host:port` that was dialed
    target: String,
    /// underlying transport error
    source: std::io::Error,
  },
  /// A processing stage that is not present was asked to be removed.
  #[error("stage topology: {0}")]
  StageTopology(String),
  /// An aggregated HTTP message exceeded the configured limit.
  #[error("message larger than {0} bytes")]
  MessageTooLarge(usize),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
}

impl Error {
  /// Create a certificate build error and log it
  pub fn certificate_build(msg: impl Into<String>) -> Self {
    let error = Error::CertificateBuild(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate generation error and log it
  pub fn certificate_generation(msg: impl Into<String>) -> Self {
    let error = Error::CertificateGeneration(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a protocol violation error
  pub fn protocol(msg: impl Into<String>) -> Self {
    Error::ProtocolViolation(msg.into())
  }

  /// Whether the error came from the peer disconnecting rather than from us.
  pub fn is_disconnect(&self) -> bool {
    match self {
      Error::IO(e) => matches!(
        e.kind(),
        ErrorKind::UnexpectedEof
          | ErrorKind::ConnectionReset
          | ErrorKind::ConnectionAborted
          | ErrorKind::BrokenPipe
      ),
      _ => false,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::certificate_build(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
