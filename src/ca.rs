//! Certificate Authority used to forge server identities for intercepted hosts.
//!
//! A [`RootIdentity`] is provisioned once (see [`RootIdentity::generate_default`])
//! and loaded read-only at startup. Leaves are issued per host with the root's
//! validity window, a subject derived from the issuer template and a SAN entry
//! for every requested host.

use crate::cache::LeafIssuer;
use crate::errors::{Error, Result};
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Issuer template of the default root.
pub const DEFAULT_ISSUER: &str = "C=CN, ST=GD, L=SZ, O=lee, OU=study, CN=Proxy";
/// File name of the persisted root certificate (DER).
pub const ROOT_CERT_FILE: &str = "ca.crt";
/// File name of the persisted root private key (PKCS#8 DER).
pub const ROOT_KEY_FILE: &str = "ca_private.der";
/// Validity of a freshly provisioned default root.
const DEFAULT_ROOT_YEARS: i64 = 20;

/// An RSA-2048 key pair.
pub struct KeyMaterial {
  inner: KeyPair,
}

impl KeyMaterial {
  /// Load a PKCS#8 DER encoded RSA private key.
  pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
    let der = PrivatePkcs8KeyDer::from(der);
    let inner = KeyPair::from_pkcs8_der_and_sign_algo(&der, &rcgen::PKCS_RSA_SHA256)
      .map_err(|e| Error::certificate_generation(format!("invalid root key: {}", e)))?;
    Ok(Self { inner })
  }
  /// Load a PEM encoded RSA private key.
  pub fn from_pem(pem: &str) -> Result<Self> {
    let inner = KeyPair::from_pem_and_sign_algo(pem, &rcgen::PKCS_RSA_SHA256)
      .map_err(|e| Error::certificate_generation(format!("invalid root key: {}", e)))?;
    Ok(Self { inner })
  }
  /// PKCS#8 DER encoding of the private key.
  pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.inner.serialize_der()))
  }
  /// PEM encoding of the private key.
  pub fn to_pem(&self) -> String {
    self.inner.serialize_pem()
  }
  pub(crate) fn key_pair(&self) -> &KeyPair {
    &self.inner
  }
}

impl std::fmt::Debug for KeyMaterial {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("KeyMaterial").finish_non_exhaustive()
  }
}

/// Generate a fresh RSA-2048 key pair from the provider's secure generator.
pub fn generate_key_pair() -> Result<KeyMaterial> {
  let inner = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
    .map_err(|e| Error::CryptoUnavailable(e.to_string()))?;
  Ok(KeyMaterial { inner })
}

/// A self-signed root certificate and its private key.
#[derive(Debug)]
pub struct RootIdentity {
  cert_der: CertificateDer<'static>,
  key: KeyMaterial,
  subject: String,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
}

impl RootIdentity {
  /// Load a root from its certificate DER and PKCS#8 key DER.
  pub fn from_der(cert_der: &[u8], key_der: &[u8]) -> Result<Self> {
    let key = KeyMaterial::from_pkcs8_der(key_der)?;
    Self::from_parts(CertificateDer::from(cert_der.to_vec()), key)
  }

  /// Load a root from PEM text.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_generation("no certificate found in PEM"))?
      .map_err(|e| Error::certificate_generation(format!("failed to parse PEM: {}", e)))?;
    let key = KeyMaterial::from_pem(key_pem)?;
    Self::from_parts(cert_der, key)
  }

  /// Read the two startup blobs from disk.
  pub async fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert = tokio::fs::read(cert_path).await?;
    let key = tokio::fs::read(key_path).await?;
    Self::from_der(&cert, &key)
  }

  /// Read `ca.crt` and `ca_private.der` from `dir`.
  pub async fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref();
    Self::load(dir.join(ROOT_CERT_FILE), dir.join(ROOT_KEY_FILE)).await
  }

  /// Write the certificate and key as DER.
  pub async fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
    tokio::fs::write(cert_path, self.cert_der.as_ref()).await?;
    tokio::fs::write(key_path, self.key.inner.serialize_der()).await?;
    Ok(())
  }

  /// Write `ca.crt` and `ca_private.der` into `dir`, creating it when missing.
  pub async fn save_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir).await?;
    self
      .save(dir.join(ROOT_CERT_FILE), dir.join(ROOT_KEY_FILE))
      .await
  }

  /// Provision a root with the default subject, valid for twenty years from now.
  pub fn generate_default() -> Result<Self> {
    let key = generate_key_pair()?;
    let now = OffsetDateTime::now_utc();
    generate_root(
      DEFAULT_ISSUER,
      now,
      now + Duration::days(365 * DEFAULT_ROOT_YEARS),
      key,
    )
  }

  fn from_parts(cert_der: CertificateDer<'static>, key: KeyMaterial) -> Result<Self> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref())
      .map_err(|e| Error::certificate_generation(format!("invalid root certificate: {}", e)))?;
    let subject = cert.subject().to_string();
    let validity = cert.validity();
    let not_before = validity.not_before.to_datetime();
    let not_after = validity.not_after.to_datetime();
    Ok(Self {
      cert_der,
      key,
      subject,
      not_before,
      not_after,
    })
  }

  /// DER encoded root certificate.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }
  /// PEM encoded root certificate, for installing into client trust stores.
  pub fn to_pem(&self) -> String {
    pem_encode("CERTIFICATE", self.cert_der.as_ref())
  }
  /// The root's private key.
  pub fn key(&self) -> &KeyMaterial {
    &self.key
  }
  /// Subject DN in `C=.., ST=.., CN=..` form.
  pub fn subject(&self) -> &str {
    &self.subject
  }
  /// Start of the validity window.
  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }
  /// End of the validity window.
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

/// A forged server certificate with its matching private key.
#[derive(Debug)]
pub struct LeafIdentity {
  cert_der: CertificateDer<'static>,
  key: KeyMaterial,
}

impl LeafIdentity {
  /// Bundle an issued certificate with its key.
  pub fn new(cert_der: CertificateDer<'static>, key: KeyMaterial) -> Self {
    Self { cert_der, key }
  }
  /// DER encoded leaf certificate.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }
  /// The leaf's private key.
  pub fn key(&self) -> &KeyMaterial {
    &self.key
  }
}

/// Build a self-signed CA certificate for `subject`.
///
/// Basic constraints are CA with a path length of zero, the serial is the
/// current time in milliseconds and the signature is SHA-256 with RSA.
pub fn generate_root(
  subject: &str,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  key: KeyMaterial,
) -> Result<RootIdentity> {
  let mut params = CertificateParams::default();
  params.distinguished_name = parse_distinguished_name(subject)?;
  params.serial_number = Some(time_serial());
  params.not_before = not_before;
  params.not_after = not_after;
  params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
  params.key_usages = vec![
    KeyUsagePurpose::KeyCertSign,
    KeyUsagePurpose::CrlSign,
    KeyUsagePurpose::DigitalSignature,
  ];
  let cert = params.self_signed(&key.inner)?;
  RootIdentity::from_parts(CertificateDer::from(cert.der().to_vec()), key)
}

/// Sign a leaf for `hosts` with `root_key`.
///
/// The issuer is `issuer_template` as given, the subject is the template with
/// its `CN` replaced by `hosts[0]`. One DNS SAN entry is added per host in order.
pub fn issue_leaf(
  issuer_template: &str,
  root_key: &KeyMaterial,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  leaf_public_key: &impl PublicKeyData,
  hosts: &[String],
) -> Result<CertificateDer<'static>> {
  let first = first_host(hosts)?;
  let mut issuer_params = CertificateParams::default();
  issuer_params.distinguished_name = parse_distinguished_name(issuer_template)?;
  issuer_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
  let issuer = Issuer::from_params(&issuer_params, root_key.key_pair());
  let subject = subject_from_issuer(issuer_template, first);
  sign_leaf(&issuer, &subject, not_before, not_after, leaf_public_key, hosts)
}

/// Sign a leaf for `hosts` under `root`, copying the root's subject Name as
/// the leaf's issuer with its original attribute string types.
///
/// Chain builders match issuer to subject byte for byte, so this is the form
/// to use with roots provisioned by other tools.
pub fn issue_leaf_from_root(
  root: &RootIdentity,
  leaf_public_key: &impl PublicKeyData,
  hosts: &[String],
) -> Result<CertificateDer<'static>> {
  let first = first_host(hosts)?;
  let issuer = Issuer::from_ca_cert_der(root.cert_der(), root.key().key_pair())?;
  let subject = subject_from_issuer(root.subject(), first);
  sign_leaf(
    &issuer,
    &subject,
    root.not_before(),
    root.not_after(),
    leaf_public_key,
    hosts,
  )
}

fn first_host(hosts: &[String]) -> Result<&String> {
  hosts
    .first()
    .ok_or_else(|| Error::certificate_build("leaf needs at least one host"))
}

fn sign_leaf(
  issuer: &Issuer<'_, &KeyPair>,
  subject: &str,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  leaf_public_key: &impl PublicKeyData,
  hosts: &[String],
) -> Result<CertificateDer<'static>> {
  let mut params = CertificateParams::default();
  params.distinguished_name = parse_distinguished_name(subject)?;
  params.serial_number = Some(time_serial());
  params.not_before = not_before;
  params.not_after = not_after;
  let mut sans = Vec::with_capacity(hosts.len());
  for host in hosts {
    let dns = host
      .as_str()
      .try_into()
      .map_err(|_| Error::certificate_build(format!("invalid host name: {}", host)))?;
    sans.push(SanType::DnsName(dns));
    if let Ok(ip) = host.parse::<IpAddr>() {
      sans.push(SanType::IpAddress(ip));
    }
  }
  params.subject_alt_names = sans;

  let cert = params.signed_by(leaf_public_key, issuer)?;
  Ok(CertificateDer::from(cert.der().to_vec()))
}

/// Replace the `CN` component of `issuer` with `host`, keeping the other
/// components in order with whitespace trimmed.
pub fn subject_from_issuer(issuer: &str, host: &str) -> String {
  issuer
    .split(',')
    .map(str::trim)
    .filter(|c| !c.is_empty())
    .map(|component| match component.split_once('=') {
      Some((key, _)) if key.trim() == "CN" => format!("CN={}", host),
      _ => component.to_string(),
    })
    .collect::<Vec<_>>()
    .join(", ")
}

/// Parse a `KEY=VALUE, KEY=VALUE` subject into a distinguished name.
pub(crate) fn parse_distinguished_name(subject: &str) -> Result<DistinguishedName> {
  let mut dn = DistinguishedName::new();
  for component in subject.split(',').map(str::trim).filter(|c| !c.is_empty()) {
    let (key, value) = component
      .split_once('=')
      .ok_or_else(|| Error::certificate_build(format!("malformed DN component: {}", component)))?;
    let ty = match key.trim() {
      "C" => DnType::CountryName,
      "ST" => DnType::StateOrProvinceName,
      "L" => DnType::LocalityName,
      "O" => DnType::OrganizationName,
      "OU" => DnType::OrganizationalUnitName,
      "CN" => DnType::CommonName,
      other => {
        return Err(Error::certificate_build(format!(
          "unsupported DN attribute: {}",
          other
        )))
      }
    };
    dn.push(ty, value.trim());
  }
  Ok(dn)
}

fn time_serial() -> SerialNumber {
  let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
  SerialNumber::from(millis as u64)
}

fn pem_encode(label: &str, der: &[u8]) -> String {
  use base64::prelude::{Engine as _, BASE64_STANDARD};
  let body = BASE64_STANDARD.encode(der);
  let mut pem = format!("-----BEGIN {}-----\n", label);
  for line in body.as_bytes().chunks(64) {
    pem.push_str(&String::from_utf8_lossy(line));
    pem.push('\n');
  }
  pem.push_str(&format!("-----END {}-----\n", label));
  pem
}

/// A root identity, optionally with an explicit issuer template stamped on its leaves.
#[derive(Debug)]
pub struct Authority {
  root: RootIdentity,
  issuer_template: Option<String>,
}

impl Authority {
  /// Issue leaves under the root's own subject Name.
  pub fn new(root: RootIdentity) -> Self {
    Self {
      root,
      issuer_template: None,
    }
  }
  /// Use an explicit issuer template, written into leaves as given.
  pub fn with_issuer(root: RootIdentity, issuer_template: impl Into<String>) -> Self {
    Self {
      root,
      issuer_template: Some(issuer_template.into()),
    }
  }
  /// The root this authority signs with.
  pub fn root(&self) -> &RootIdentity {
    &self.root
  }
  /// Issuer DN written into every leaf.
  pub fn issuer_template(&self) -> &str {
    self
      .issuer_template
      .as_deref()
      .unwrap_or_else(|| self.root.subject())
  }
}

impl LeafIssuer for Authority {
  fn issue(&self, host: &str) -> Result<LeafIdentity> {
    let key = generate_key_pair()?;
    let hosts = [host.to_string()];
    let cert_der = match &self.issuer_template {
      Some(template) => issue_leaf(
        template,
        self.root.key(),
        self.root.not_before(),
        self.root.not_after(),
        key.key_pair(),
        &hosts,
      )?,
      None => issue_leaf_from_root(&self.root, key.key_pair(), &hosts)?,
    };
    Ok(LeafIdentity::new(cert_der, key))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cn_is_replaced_and_order_kept() {
    assert_eq!(
      subject_from_issuer(DEFAULT_ISSUER, "example.com"),
      "C=CN, ST=GD, L=SZ, O=lee, OU=study, CN=example.com"
    );
    assert_eq!(
      subject_from_issuer("CN=Proxy,O=lee ,  C=CN", "a.test"),
      "CN=a.test, O=lee, C=CN"
    );
  }

  #[test]
  fn unknown_dn_attribute_is_rejected() {
    assert!(parse_distinguished_name("C=CN, EMAIL=a@b").is_err());
    assert!(parse_distinguished_name("C=CN, broken").is_err());
  }

  #[test]
  fn leaf_requires_a_host() {
    let root = RootIdentity::generate_default().unwrap();
    let leaf_key = generate_key_pair().unwrap();
    let result = issue_leaf(
      DEFAULT_ISSUER,
      root.key(),
      root.not_before(),
      root.not_after(),
      leaf_key.key_pair(),
      &[],
    );
    assert!(matches!(result, Err(Error::CertificateBuild(_))));
  }

  #[test]
  fn root_round_trips_through_der() {
    let root = RootIdentity::generate_default().unwrap();
    assert_eq!(root.subject(), DEFAULT_ISSUER);
    let key = root.key().private_key_der();
    let loaded = RootIdentity::from_der(root.cert_der().as_ref(), key.secret_der()).unwrap();
    assert_eq!(loaded.cert_der(), root.cert_der());
    assert_eq!(loaded.subject(), root.subject());
    assert!(root.to_pem().starts_with("-----BEGIN CERTIFICATE-----\n"));
  }
}
