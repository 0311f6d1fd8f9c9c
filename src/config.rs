use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::cache::{CacheConfig, RedisConfig};
use crate::db::PoolConfig;
use crate::query::OptimizerConfig;

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax.
fn expand_env_vars(input: &str) -> String {
  let mut result = String::with_capacity(input.len());
  let mut rest = input;

  while let Some(pos) = rest.find('$') {
    result.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];

    if let Some(braced) = after.strip_prefix('{') {
      if let Some(end) = braced.find('}') {
        result.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
        rest = &braced[end + 1..];
        continue;
      }
    }

    let var_len = after
      .chars()
      .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
      .count();
    if var_len > 0 {
      result.push_str(&std::env::var(&after[..var_len]).unwrap_or_default());
    } else {
      result.push('$');
    }
    rest = &after[var_len..];
  }

  result.push_str(rest);
  result
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub redis: RedisConfig,
  #[serde(default)]
  pub database: DatabaseSection,
  #[serde(default)]
  pub optimizer: OptimizerConfig,
  #[serde(default)]
  pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
  /// `postgres://...`, `sqlite://path` or a bare SQLite path
  #[serde(default = "default_database_url")]
  pub url: String,
  #[serde(flatten)]
  pub pool: PoolConfig,
}
fn default_database_url() -> String {
  "sqlite://tierdb.db".into()
}
impl Default for DatabaseSection {
  fn default() -> Self {
    Self {
      url: default_database_url(),
      pool: PoolConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
  /// Emit one JSON object per line
  #[serde(default)]
  pub json: bool,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
      json: false,
    }
  }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T, anyhow::Error>
where
  T::Err: std::fmt::Display,
{
  raw
    .trim()
    .parse()
    .map_err(|e| anyhow::anyhow!("invalid value for {}: {:?} ({})", name, raw, e))
}

impl Config {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let path = path.as_ref();
    let content =
      std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["tierdb.yaml", "tierdb.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  /// Config file if present, otherwise defaults, then `TIERDB_*` overrides
  pub fn load() -> Result<Self, anyhow::Error> {
    let mut config = Self::find_and_load()?.unwrap_or_default();
    config.apply_env()?;
    Ok(config)
  }

  /// Override options from `TIERDB_*` environment variables
  pub fn apply_env(&mut self) -> Result<(), anyhow::Error> {
    self.apply_vars(|name| std::env::var(name).ok())
  }

  /// Override options from any variable source
  pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), anyhow::Error> {
    macro_rules! set {
      ($name:literal, $field:expr) => {
        if let Some(raw) = lookup($name) {
          $field = parse_var($name, &raw)?;
        }
      };
    }

    set!("TIERDB_DEFAULT_TTL_SECONDS", self.cache.default_ttl_seconds);
    set!("TIERDB_MAX_MEMORY_ITEMS", self.cache.max_memory_items);
    set!("TIERDB_COMPRESSION_THRESHOLD_BYTES", self.cache.compression_threshold_bytes);
    set!("TIERDB_POOL_MIN_SIZE", self.database.pool.min_size);
    set!("TIERDB_POOL_MAX_SIZE", self.database.pool.max_size);
    set!("TIERDB_CONNECT_TIMEOUT_MS", self.database.pool.connect_timeout_ms);
    set!("TIERDB_COMMAND_TIMEOUT_MS", self.database.pool.command_timeout_ms);
    set!("TIERDB_MAX_IDLE_TIME_MS", self.database.pool.max_idle_time_ms);
    set!("TIERDB_SLOW_QUERY_THRESHOLD_MS", self.optimizer.slow_query_threshold_ms);

    if let Some(url) = lookup("TIERDB_DATABASE_URL") {
      self.database.url = url;
    }
    if let Some(url) = lookup("TIERDB_READ_REPLICA_URL") {
      self.database.pool.read_replica_url = Some(url);
    }
    if let Some(url) = lookup("TIERDB_REDIS_URL") {
      self.redis.url = Some(url);
    }
    set!("TIERDB_REDIS_ENABLED", self.redis.enabled);
    if let Some(level) = lookup("TIERDB_LOG_LEVEL") {
      self.logging.level = level;
    }
    Ok(())
  }
}
