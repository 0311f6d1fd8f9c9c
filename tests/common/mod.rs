//! Fakes shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tierdb::cache::{glob_to_regex, CacheConfig, CacheError, DistributedStore};
use tierdb::db::{
  Connection, Connector, DbError, PoolConfig, QueryResult, Row, SessionSettings, SqlDialect, SqlValue,
};

// -- database --

/// Shared state behind every connection a [`FakeConnector`] opens
#[derive(Default)]
pub struct FakeDb {
  pub connects: AtomicUsize,
  pub queries: AtomicUsize,
  pub fail_connect: AtomicBool,
  /// Statements containing this text fail
  pub fail_on: Mutex<Option<String>>,
  pub delay: Mutex<Duration>,
  pub connect_delay: Mutex<Duration>,
  /// Every statement seen, including BEGIN/COMMIT/ROLLBACK
  pub log: Mutex<Vec<String>>,
}

impl FakeDb {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock() = delay;
  }

  pub fn set_connect_delay(&self, delay: Duration) {
    *self.connect_delay.lock() = delay;
  }

  pub fn fail_on(&self, fragment: &str) {
    *self.fail_on.lock() = Some(fragment.to_string());
  }

  pub fn log(&self) -> Vec<String> {
    self.log.lock().clone()
  }

  pub fn query_count(&self) -> usize {
    self.queries.load(Ordering::SeqCst)
  }
}

pub struct FakeConnector {
  pub db: Arc<FakeDb>,
  pub dialect: SqlDialect,
}

impl FakeConnector {
  pub fn new(db: &Arc<FakeDb>) -> Arc<Self> {
    Arc::new(Self {
      db: db.clone(),
      dialect: SqlDialect::Postgres,
    })
  }
}

#[async_trait]
impl Connector for FakeConnector {
  async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
    if self.db.fail_connect.load(Ordering::SeqCst) {
      return Err(DbError::Connect("fake: refused".into()));
    }
    let delay = *self.db.connect_delay.lock();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    self.db.connects.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(FakeConnection {
      db: self.db.clone(),
      dialect: self.dialect,
      in_transaction: false,
    }))
  }

  fn dialect(&self) -> SqlDialect {
    self.dialect
  }

  fn describe(&self) -> String {
    "fake://db".into()
  }
}

pub struct FakeConnection {
  db: Arc<FakeDb>,
  dialect: SqlDialect,
  in_transaction: bool,
}

#[async_trait]
impl Connection for FakeConnection {
  fn dialect(&self) -> SqlDialect {
    self.dialect
  }

  async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
    let delay = *self.db.delay.lock();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    self.db.queries.fetch_add(1, Ordering::SeqCst);
    self.db.log.lock().push(sql.to_string());

    let failing = self.db.fail_on.lock().clone();
    if failing.is_some_and(|f| sql.contains(&f)) {
      return Err(DbError::execution(sql, "fake: injected failure"));
    }

    if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
      let columns = vec!["id".to_string(), "sql".to_string(), "params".to_string()];
      let row = Row::new(
        columns.clone(),
        vec![
          SqlValue::Int(1),
          SqlValue::Text(sql.to_string()),
          SqlValue::Int(params.len() as i64),
        ],
      );
      Ok(QueryResult {
        columns,
        rows: vec![row],
        rows_affected: 1,
      })
    } else {
      Ok(QueryResult::affected(1))
    }
  }

  async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
    self.query(sql, &[]).await.map(|_| ())
  }

  async fn prepare(&mut self, _sql: &str) -> Result<(), DbError> {
    Ok(())
  }

  async fn configure_session(&mut self, _settings: &SessionSettings) -> Result<(), DbError> {
    Ok(())
  }

  async fn begin(&mut self) -> Result<(), DbError> {
    self.db.log.lock().push("BEGIN".into());
    self.in_transaction = true;
    Ok(())
  }

  async fn commit(&mut self) -> Result<(), DbError> {
    self.db.log.lock().push("COMMIT".into());
    self.in_transaction = false;
    Ok(())
  }

  async fn rollback(&mut self) -> Result<(), DbError> {
    self.db.log.lock().push("ROLLBACK".into());
    self.in_transaction = false;
    Ok(())
  }

  fn in_transaction(&self) -> bool {
    self.in_transaction
  }

  async fn is_valid(&mut self) -> bool {
    true
  }
}

/// Small pool with short timeouts
pub fn pool_config(min_size: usize, max_size: usize) -> PoolConfig {
  PoolConfig {
    min_size,
    max_size,
    connect_timeout_ms: 100,
    command_timeout_ms: 1_000,
    ..PoolConfig::default()
  }
}

// -- distributed cache --

/// In-process stand-in for Redis that honors TTLs and glob deletes, and can
/// be taken down and brought back
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
  pub gets: AtomicUsize,
  down: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.lock().contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn set_down(&self, down: bool) {
    self.down.store(down, Ordering::SeqCst);
  }

  pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
    self.entries.lock().get(key).map(|(v, _)| v.clone())
  }

  fn check(&self) -> Result<(), CacheError> {
    if self.down.load(Ordering::SeqCst) {
      return Err(CacheError::BackendUnavailable("connection reset".into()));
    }
    Ok(())
  }
}

#[async_trait]
impl DistributedStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    self.gets.fetch_add(1, Ordering::SeqCst);
    self.check()?;
    let mut entries = self.entries.lock();
    let expired = matches!(entries.get(key), Some((_, Some(at))) if Instant::now() >= *at);
    if expired {
      entries.remove(key);
      return Ok(None);
    }
    Ok(entries.get(key).map(|(v, _)| v.clone()))
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
    self.check()?;
    let expires = ttl.map(|t| Instant::now() + t);
    self.entries.lock().insert(key.to_string(), (value, expires));
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheError> {
    self.check()?;
    Ok(self.entries.lock().remove(key).is_some())
  }

  async fn delete_matching(&self, pattern: &str, _batch_size: usize) -> Result<usize, CacheError> {
    self.check()?;
    let re = glob_to_regex(pattern).map_err(|e| CacheError::BackendUnavailable(e.to_string()))?;
    let mut entries = self.entries.lock();
    let before = entries.len();
    entries.retain(|k, _| !re.is_match(k));
    Ok(before - entries.len())
  }

  async fn ping(&self) -> Result<(), CacheError> {
    self.check()
  }

  fn name(&self) -> &'static str {
    "memory"
  }
}

/// A distributed tier that is always down
#[derive(Default)]
pub struct DownStore {
  pub calls: AtomicUsize,
}

impl DownStore {
  fn fail<T>(&self) -> Result<T, CacheError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    Err(CacheError::BackendUnavailable("connection refused".into()))
  }
}

#[async_trait]
impl DistributedStore for DownStore {
  async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    self.fail()
  }

  async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<(), CacheError> {
    self.fail()
  }

  async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
    self.fail()
  }

  async fn delete_matching(&self, _pattern: &str, _batch_size: usize) -> Result<usize, CacheError> {
    self.fail()
  }

  async fn ping(&self) -> Result<(), CacheError> {
    self.fail()
  }

  fn name(&self) -> &'static str {
    "down"
  }
}

/// Cache settings sized for tests
pub fn cache_config(max_items: usize) -> CacheConfig {
  CacheConfig {
    max_memory_items: max_items,
    ..CacheConfig::default()
  }
}
