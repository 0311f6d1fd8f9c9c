use thiserror::Error;

/// Errors raised inside the cache subsystem.
///
/// Only `Serialization` and `EvictionInvariant` ever reach callers; backend
/// failures are absorbed by the manager and turned into misses.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("distributed cache unavailable: {0}")]
  BackendUnavailable(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("memory tier holds {len} entries, capacity is {max}")]
  EvictionInvariant { len: usize, max: usize },
}

impl From<serde_json::Error> for CacheError {
  fn from(e: serde_json::Error) -> Self {
    CacheError::Serialization(e.to_string())
  }
}

impl From<redis::RedisError> for CacheError {
  fn from(e: redis::RedisError) -> Self {
    CacheError::BackendUnavailable(e.to_string())
  }
}
