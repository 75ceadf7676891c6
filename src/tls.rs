//! TLS configuration for both legs of an intercepted connection.
//!
use crate::ca::{LeafIdentity, RootIdentity};
use crate::errors::Result;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Client config for the outbound leg: the real server's certificate is not
/// verified, the proxy only needs the decrypted stream.
pub fn insecure_client_config() -> Result<rustls::ClientConfig> {
  let config = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  Ok(config)
}

/// Connector built from [`insecure_client_config`].
pub fn insecure_connector() -> Result<TlsConnector> {
  Ok(TlsConnector::from(Arc::new(insecure_client_config()?)))
}

/// Server config presenting `leaf`, chained to `root` when given.
pub fn server_config(leaf: &LeafIdentity, root: Option<&RootIdentity>) -> Result<rustls::ServerConfig> {
  let mut chain = vec![leaf.cert_der().clone()];
  if let Some(root) = root {
    chain.push(root.cert_der().clone());
  }
  let config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(chain, leaf.key().private_key_der())?;
  Ok(config)
}

/// Acceptor presenting `leaf` to the client.
pub fn acceptor(leaf: &LeafIdentity, root: Option<&RootIdentity>) -> Result<TlsAcceptor> {
  Ok(TlsAcceptor::from(Arc::new(server_config(leaf, root)?)))
}

/// `ServerName` for SNI toward `host`, accepting DNS names and IP literals.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(host.to_owned())
    .map_err(|e| crate::errors::Error::protocol(format!("invalid server name {}: {}", host, e)))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls_pki_types::CertificateDer,
    _intermediates: &[rustls_pki_types::CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}
