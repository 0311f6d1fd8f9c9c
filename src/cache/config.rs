//! Cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tiered cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  /// Default TTL in seconds (0 = no expiry)
  #[serde(default = "default_ttl_seconds")]
  pub default_ttl_seconds: u64,

  /// Capacity of the in-process tier, in entries
  #[serde(default = "default_max_memory_items")]
  pub max_memory_items: usize,

  /// Payloads larger than this are considered for compression
  #[serde(default = "default_compression_threshold")]
  pub compression_threshold_bytes: usize,

  /// Namespace prepended to every storage key
  #[serde(default = "default_key_prefix")]
  pub key_prefix: String,

  /// Upper bound for any single distributed-tier call
  #[serde(default = "default_operation_timeout_ms")]
  pub operation_timeout_ms: u64,

  /// How long the distributed tier is skipped after a failure
  #[serde(default = "default_distributed_retry_secs")]
  pub distributed_retry_secs: u64,

  /// SCAN COUNT hint and DEL batch size for invalidation
  #[serde(default = "default_invalidate_batch_size")]
  pub invalidate_batch_size: usize,

  #[serde(default = "default_cleanup_interval")]
  pub cleanup_interval_secs: u64,

  #[serde(default = "default_stats_interval")]
  pub stats_interval_secs: u64,

  /// Hit rate below which a reporting window counts as low
  #[serde(default = "default_low_hit_rate_threshold")]
  pub low_hit_rate_threshold: f64,

  /// Windows with fewer requests are ignored by the low hit rate alert
  #[serde(default = "default_low_hit_rate_min_requests")]
  pub low_hit_rate_min_requests: u64,

  /// Consecutive low windows needed before alerting
  #[serde(default = "default_low_hit_rate_windows")]
  pub low_hit_rate_windows: u32,
}

fn default_ttl_seconds() -> u64 {
  3600
}

fn default_max_memory_items() -> usize {
  1000
}

fn default_compression_threshold() -> usize {
  1024
}

fn default_key_prefix() -> String {
  "tierdb".to_string()
}

fn default_operation_timeout_ms() -> u64 {
  1000
}

fn default_distributed_retry_secs() -> u64 {
  30
}

fn default_invalidate_batch_size() -> usize {
  500
}

fn default_cleanup_interval() -> u64 {
  60
}

fn default_stats_interval() -> u64 {
  300
}

fn default_low_hit_rate_threshold() -> f64 {
  0.5
}

fn default_low_hit_rate_min_requests() -> u64 {
  100
}

fn default_low_hit_rate_windows() -> u32 {
  3
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_seconds: default_ttl_seconds(),
      max_memory_items: default_max_memory_items(),
      compression_threshold_bytes: default_compression_threshold(),
      key_prefix: default_key_prefix(),
      operation_timeout_ms: default_operation_timeout_ms(),
      distributed_retry_secs: default_distributed_retry_secs(),
      invalidate_batch_size: default_invalidate_batch_size(),
      cleanup_interval_secs: default_cleanup_interval(),
      stats_interval_secs: default_stats_interval(),
      low_hit_rate_threshold: default_low_hit_rate_threshold(),
      low_hit_rate_min_requests: default_low_hit_rate_min_requests(),
      low_hit_rate_windows: default_low_hit_rate_windows(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_seconds)
  }

  pub fn operation_timeout(&self) -> Duration {
    Duration::from_millis(self.operation_timeout_ms.max(1))
  }

  pub fn distributed_retry(&self) -> Duration {
    Duration::from_secs(self.distributed_retry_secs)
  }

  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_secs(self.cleanup_interval_secs.max(1))
  }

  pub fn stats_interval(&self) -> Duration {
    Duration::from_secs(self.stats_interval_secs.max(1))
  }
}

/// Connection settings for the Redis-backed distributed tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
  /// When false the cache runs memory-only
  #[serde(default = "default_true")]
  pub enabled: bool,

  /// Full connection URL; overrides the individual fields below
  #[serde(default)]
  pub url: Option<String>,

  #[serde(default = "default_host")]
  pub host: String,

  #[serde(default = "default_redis_port")]
  pub port: u16,

  #[serde(default)]
  pub password: Option<String>,

  /// Redis database number
  #[serde(default)]
  pub database: u8,

  #[serde(default)]
  pub tls_enabled: bool,

  #[serde(default = "default_redis_connect_timeout_ms")]
  pub connect_timeout_ms: u64,
}

fn default_true() -> bool {
  true
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_redis_port() -> u16 {
  6379
}

fn default_redis_connect_timeout_ms() -> u64 {
  2000
}

impl Default for RedisConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      url: None,
      host: default_host(),
      port: default_redis_port(),
      password: None,
      database: 0,
      tls_enabled: false,
      connect_timeout_ms: default_redis_connect_timeout_ms(),
    }
  }
}

impl RedisConfig {
  /// Generate Redis connection URL
  pub fn connection_url(&self) -> String {
    if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
      return url.to_string();
    }
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", pwd),
      _ => String::new(),
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms.max(1))
  }
}
