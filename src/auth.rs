//! Proxy credential checks.
use base64::prelude::{Engine as _, BASE64_STANDARD};

/// Decides whether a username/password pair may use the proxy.
pub trait Authenticator: Send + Sync {
  /// `true` when the credentials are accepted.
  fn verify(&self, username: &str, password: &str) -> bool;
}

impl<F> Authenticator for F
where
  F: Fn(&str, &str) -> bool + Send + Sync,
{
  fn verify(&self, username: &str, password: &str) -> bool {
    self(username, password)
  }
}

/// A single fixed username/password pair.
#[derive(Clone)]
pub struct StaticCredentials {
  username: String,
  password: String,
}

impl StaticCredentials {
  /// Accept exactly `username` with `password`.
  pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      username: username.into(),
      password: password.into(),
    }
  }
}

impl std::fmt::Debug for StaticCredentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StaticCredentials")
      .field("username", &self.username)
      .finish_non_exhaustive()
  }
}

impl Authenticator for StaticCredentials {
  fn verify(&self, username: &str, password: &str) -> bool {
    self.username == username && self.password == password
  }
}

/// Decode a `Basic <base64(user:pass)>` header value.
///
/// The scheme is matched case-insensitively and the password may contain `:`.
pub fn decode_basic_auth(value: &[u8]) -> Option<(String, String)> {
  let value = std::str::from_utf8(value).ok()?.trim();
  let (scheme, token) = value.split_once(' ')?;
  if !scheme.eq_ignore_ascii_case("basic") {
    return None;
  }
  let decoded = BASE64_STANDARD.decode(token.trim()).ok()?;
  let decoded = String::from_utf8(decoded).ok()?;
  let (username, password) = decoded.split_once(':')?;
  Some((username.to_string(), password.to_string()))
}

/// Encode credentials as a `Basic` header value.
pub fn encode_basic_auth(username: &str, password: &str) -> String {
  format!(
    "Basic {}",
    BASE64_STANDARD.encode(format!("{}:{}", username, password))
  )
}
