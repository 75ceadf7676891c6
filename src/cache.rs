//! Identity cache keyed by `host:port`.
use crate::ca::LeafIdentity;
use crate::errors::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum number of cached leaves before the whole cache is flushed.
pub const DEFAULT_CAPACITY: usize = 5000;

/// Something able to issue a forged leaf for a host.
pub trait LeafIssuer: Send + Sync {
  /// Issue a fresh leaf bound to `host`.
  fn issue(&self, host: &str) -> Result<LeafIdentity>;
}

/// Maps `host:port` to a previously issued leaf.
///
/// When an insert finds the cache at capacity every entry is dropped first, so
/// the size never exceeds the capacity right after an insert. Concurrent misses
/// on one key may each issue a leaf; the last insert wins.
pub struct IdentityCache {
  issuer: Arc<dyn LeafIssuer>,
  capacity: usize,
  entries: RwLock<HashMap<String, Arc<LeafIdentity>>>,
}

impl IdentityCache {
  /// Cache with the default capacity.
  pub fn new(issuer: Arc<dyn LeafIssuer>) -> Self {
    Self::with_capacity(issuer, DEFAULT_CAPACITY)
  }

  /// Cache flushing once `capacity` entries are held.
  pub fn with_capacity(issuer: Arc<dyn LeafIssuer>, capacity: usize) -> Self {
    Self {
      issuer,
      capacity: capacity.max(1),
      entries: RwLock::new(HashMap::new()),
    }
  }

  /// Return the cached leaf for `host:port`, issuing and inserting one on a miss.
  pub fn get_or_create(&self, host: &str, port: u16) -> Result<Arc<LeafIdentity>> {
    let key = cache_key(host, port);
    if let Some(leaf) = self.entries.read().get(&key) {
      return Ok(leaf.clone());
    }
    let leaf = self.issuer.issue(host).map_err(|e| {
      Error::certificate_generation(format!("cannot issue leaf for {}: {}", key, e))
    })?;
    let leaf = Arc::new(leaf);
    let mut entries = self.entries.write();
    if entries.len() >= self.capacity {
      tracing::debug!("identity cache reached {} entries, flushing", entries.len());
      entries.clear();
    }
    entries.insert(key, leaf.clone());
    Ok(leaf)
  }

  /// Lookup without issuing.
  pub fn get(&self, host: &str, port: u16) -> Option<Arc<LeafIdentity>> {
    self.entries.read().get(&cache_key(host, port)).cloned()
  }

  /// Number of cached leaves.
  pub fn len(&self) -> usize {
    self.entries.read().len()
  }

  /// Whether nothing is cached.
  pub fn is_empty(&self) -> bool {
    self.entries.read().is_empty()
  }

  /// Capacity that triggers a flush.
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Drop every cached leaf.
  pub fn clear(&self) {
    self.entries.write().clear();
  }
}

impl std::fmt::Debug for IdentityCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IdentityCache")
      .field("capacity", &self.capacity)
      .field("len", &self.len())
      .finish()
  }
}

fn cache_key(host: &str, port: u16) -> String {
  format!("{}:{}", host, port)
}
