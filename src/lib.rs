#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # sokcs
//!
//! The `sokcs` crate is an intercepting forward proxy. It serves two fronts:
//!
//! - SOCKS4a and SOCKS5, with optional RFC1929 username/password auth
//! - an HTTP proxy relaying plain requests and `CONNECT` tunnels
//!
//! When an [`Inspector`] and an [`Authority`] are configured, `CONNECT`
//! tunnels are decrypted: the client is handed a leaf certificate forged for
//! the requested host and signed by the local root, the target is reached over
//! TLS, and every decoded request is shown to the inspector before it is
//! forwarded.
//!
//! ## Running both fronts
//!
//! ```rust,no_run
//! # async fn run() -> sokcs::Result<()> {
//! let root = sokcs::RootIdentity::generate_default()?;
//! let server = sokcs::ProxyServer::builder()
//!   .authenticator(sokcs::StaticCredentials::new("aa", "aa"))
//!   .inspector(sokcs::LoggingInspector)
//!   .authority(sokcs::Authority::new(root))
//!   .build()?;
//! server.run().await
//! # }
//! ```
//!
//! ## Forging a leaf
//!
//! ```rust,no_run
//! # fn run() -> sokcs::Result<()> {
//! use std::sync::Arc;
//! let authority = sokcs::Authority::new(sokcs::RootIdentity::generate_default()?);
//! let cache = sokcs::IdentityCache::new(Arc::new(authority));
//! let leaf = cache.get_or_create("example.com", 443)?;
//! assert_eq!(cache.len(), 1);
//! # let _ = leaf;
//! # Ok(())
//! # }
//! ```
mod auth;
/// Root and leaf certificates
pub mod ca;
mod cache;
/// Incremental HTTP/1.x decoders
pub mod codec;
mod config;
mod connector;
mod errors;
/// HTTP proxy front
pub mod http_proxy;
mod inspect;
mod message;
mod relay;
mod server;
mod socket;
/// SOCKS4a/5 front
pub mod socks;
/// Per-connection stages and pipelines
pub mod stage;
mod tls;

pub use auth::{decode_basic_auth, encode_basic_auth, Authenticator, StaticCredentials};
pub use ca::{Authority, KeyMaterial, LeafIdentity, RootIdentity};
pub use cache::{IdentityCache, LeafIssuer};
pub use config::{ProxyConfig, DEFAULT_HTTP_PORT, DEFAULT_SOCKS_PORT};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use inspect::{Inspector, LoggingInspector};
pub use message::{Request, Response};
pub use relay::{CapturingRelay, ConnectionPair, RawRelay};
pub use server::{ProxyServer, ProxyServerBuilder};
pub use socket::Rewind;
pub use tokio_rustls;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
