//! Cache entry types

use bytes::Bytes;
use std::time::{Duration, Instant};

/// A cached entry with metadata
///
/// `value` holds the encoded payload exactly as it was written, compressed
/// when `compressed` is set. `size_bytes` is measured on that encoded form.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub value: Bytes,
  pub scope: String,
  /// `None` marks an entry that never expires
  pub ttl: Option<Duration>,
  pub created_at: Instant,
  pub last_accessed_at: Instant,
  pub access_count: u64,
  pub size_bytes: usize,
  pub compressed: bool,
}

impl CacheEntry {
  pub fn new(
    key: String,
    scope: String,
    value: Bytes,
    compressed: bool,
    ttl: Option<Duration>,
  ) -> Self {
    let now = Instant::now();
    let size_bytes = value.len() + key.len();
    Self {
      key,
      value,
      scope,
      ttl,
      created_at: now,
      last_accessed_at: now,
      access_count: 0,
      size_bytes,
      compressed,
    }
  }

  pub fn expires_at(&self) -> Option<Instant> {
    self.ttl.map(|ttl| self.created_at + ttl)
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Instant::now())
  }

  pub fn is_expired_at(&self, now: Instant) -> bool {
    self.expires_at().map(|exp| now >= exp).unwrap_or(false)
  }

  pub fn ttl_remaining(&self) -> Option<Duration> {
    self
      .expires_at()
      .map(|exp| exp.saturating_duration_since(Instant::now()))
  }

  pub fn age(&self) -> Duration {
    self.created_at.elapsed()
  }

  pub fn touch(&mut self) {
    self.last_accessed_at = Instant::now();
    self.access_count += 1;
  }
}

/// Converts a caller-supplied TTL into the entry representation.
/// A zero duration means "no expiry".
pub fn effective_ttl(ttl: Duration) -> Option<Duration> {
  if ttl.is_zero() {
    None
  } else {
    Some(ttl)
  }
}
