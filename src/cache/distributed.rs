//! Distributed (L2) cache tier

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

use super::config::RedisConfig;
use super::error::CacheError;

/// Shared key-value store behind the in-process tier.
///
/// Implementations deal in opaque bytes; the manager owns the envelope format.
/// Errors are reported as `CacheError::BackendUnavailable` and never reach
/// cache callers.
#[async_trait]
pub trait DistributedStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

  /// Store `value`; `ttl == None` keeps it until deleted
  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError>;

  async fn delete(&self, key: &str) -> Result<bool, CacheError>;

  /// Delete every key matching a glob `pattern`, `batch_size` keys at a time
  async fn delete_matching(&self, pattern: &str, batch_size: usize) -> Result<usize, CacheError>;

  async fn ping(&self) -> Result<(), CacheError>;

  fn name(&self) -> &'static str;
}

/// Redis-backed distributed tier
pub struct RedisStore {
  connection: ConnectionManager,
}

impl RedisStore {
  /// Connect using the given configuration, bounded by its connect timeout
  pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
    let client = Client::open(config.connection_url())?;
    let connection = tokio::time::timeout(config.connect_timeout(), ConnectionManager::new(client))
      .await
      .map_err(|_| {
        CacheError::BackendUnavailable(format!(
          "connect timed out after {}ms",
          config.connect_timeout_ms
        ))
      })??;

    let store = Self { connection };
    store.ping().await?;
    Ok(store)
  }
}

#[async_trait]
impl DistributedStore for RedisStore {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    let mut conn = self.connection.clone();
    let value: Option<Vec<u8>> = conn.get(key).await?;
    Ok(value)
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
    let mut conn = self.connection.clone();
    match ttl {
      Some(duration) => {
        let millis = (duration.as_millis() as u64).max(1);
        conn.pset_ex::<_, _, ()>(key, value, millis).await?;
      }
      None => {
        conn.set::<_, _, ()>(key, value).await?;
      }
    }
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheError> {
    let mut conn = self.connection.clone();
    let removed: i64 = conn.del(key).await?;
    Ok(removed > 0)
  }

  async fn delete_matching(&self, pattern: &str, batch_size: usize) -> Result<usize, CacheError> {
    let mut conn = self.connection.clone();
    let mut cursor: u64 = 0;
    let mut removed = 0usize;

    loop {
      let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(batch_size.max(1))
        .query_async(&mut conn)
        .await?;

      for chunk in keys.chunks(batch_size.max(1)) {
        let n: usize = conn.del(chunk).await?;
        removed += n;
      }

      if next == 0 {
        break;
      }
      cursor = next;
    }

    Ok(removed)
  }

  async fn ping(&self) -> Result<(), CacheError> {
    let mut conn = self.connection.clone();
    redis::cmd("PING").query_async::<()>(&mut conn).await?;
    Ok(())
  }

  fn name(&self) -> &'static str {
    "redis"
  }
}
