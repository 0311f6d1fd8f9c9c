//! Read/write connection pools
//!
//! Each role gets a `deadpool` managed pool of boxed [`Connection`]s. When no
//! read replica is configured the read role shares the write pool. Every new
//! connection gets session tuning and statement pre-registration before it is
//! handed out; both steps are best effort.

use deadpool::managed::{self, Metrics, Object, PoolError, RecycleError, RecycleResult};
use deadpool::Runtime;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backend::{Connection, Connector, SessionSettings, SqlDialect};
use super::error::DbError;
use super::postgres::PostgresConnector;
use super::sqlite::SqliteConnector;

/// Which pool a caller needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolIntent {
  Read,
  Write,
}

impl std::fmt::Display for PoolIntent {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PoolIntent::Read => write!(f, "read"),
      PoolIntent::Write => write!(f, "write"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
  Uninitialized,
  Initializing,
  Ready,
  Draining,
  Closed,
}

impl std::fmt::Display for PoolState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PoolState::Uninitialized => write!(f, "uninitialized"),
      PoolState::Initializing => write!(f, "initializing"),
      PoolState::Ready => write!(f, "ready"),
      PoolState::Draining => write!(f, "draining"),
      PoolState::Closed => write!(f, "closed"),
    }
  }
}

/// Pool sizing and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
  /// Connections opened eagerly and kept through idle reaping
  #[serde(default = "default_min_size", rename = "pool_min_size")]
  pub min_size: usize,

  #[serde(default = "default_max_size", rename = "pool_max_size")]
  pub max_size: usize,

  /// Longest a checkout may take, waiting and opening included
  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,

  /// Longest a single statement may run
  #[serde(default = "default_command_timeout_ms")]
  pub command_timeout_ms: u64,

  /// Idle connections beyond `min_size` are closed after this long
  #[serde(default = "default_max_idle_time_ms")]
  pub max_idle_time_ms: u64,

  #[serde(default = "default_idle_in_transaction_timeout_ms")]
  pub idle_in_transaction_timeout_ms: u64,

  /// Separate read pool target; reads share the write pool when unset
  #[serde(default)]
  pub read_replica_url: Option<String>,

  /// Statements prepared on every new connection
  #[serde(default)]
  pub prepared_statements: Vec<String>,
}

fn default_min_size() -> usize {
  5
}

fn default_max_size() -> usize {
  20
}

fn default_connect_timeout_ms() -> u64 {
  10_000
}

fn default_command_timeout_ms() -> u64 {
  60_000
}

fn default_max_idle_time_ms() -> u64 {
  300_000
}

fn default_idle_in_transaction_timeout_ms() -> u64 {
  60_000
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      min_size: default_min_size(),
      max_size: default_max_size(),
      connect_timeout_ms: default_connect_timeout_ms(),
      command_timeout_ms: default_command_timeout_ms(),
      max_idle_time_ms: default_max_idle_time_ms(),
      idle_in_transaction_timeout_ms: default_idle_in_transaction_timeout_ms(),
      read_replica_url: None,
      prepared_statements: Vec::new(),
    }
  }
}

impl PoolConfig {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn command_timeout(&self) -> Duration {
    Duration::from_millis(self.command_timeout_ms)
  }

  pub fn max_idle_time(&self) -> Duration {
    Duration::from_millis(self.max_idle_time_ms)
  }

  pub fn validate(&self) -> Result<(), DbError> {
    if self.max_size == 0 {
      return Err(DbError::Config("pool_max_size must be at least 1".into()));
    }
    if self.min_size > self.max_size {
      return Err(DbError::Config(format!(
        "pool_min_size ({}) exceeds pool_max_size ({})",
        self.min_size, self.max_size
      )));
    }
    if self.connect_timeout_ms == 0 || self.command_timeout_ms == 0 {
      return Err(DbError::Config("timeouts must be positive".into()));
    }
    Ok(())
  }

  fn session_settings(&self) -> SessionSettings {
    SessionSettings {
      statement_timeout: self.command_timeout(),
      idle_in_transaction_timeout: Duration::from_millis(self.idle_in_transaction_timeout_ms),
      busy_timeout: self.connect_timeout(),
    }
  }
}

/// Pick a connector from the DSN scheme
pub fn connector_for(dsn: &str) -> Result<Arc<dyn Connector>, DbError> {
  if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
    return Ok(Arc::new(PostgresConnector::new(dsn)?));
  }
  if dsn.starts_with("sqlite:") {
    return Ok(Arc::new(SqliteConnector::from_dsn(dsn)));
  }
  if dsn.contains("://") {
    return Err(DbError::Config(format!(
      "unsupported database scheme: {}",
      super::backend::mask_password(dsn)
    )));
  }
  if dsn.is_empty() {
    return Err(DbError::Config("database url is empty".into()));
  }
  Ok(Arc::new(SqliteConnector::from_dsn(dsn)))
}

/// deadpool manager producing initialized connections
pub struct ConnectorManager {
  connector: Arc<dyn Connector>,
  session: SessionSettings,
  prepared: Vec<String>,
}

impl managed::Manager for ConnectorManager {
  type Type = Box<dyn Connection>;
  type Error = DbError;

  async fn create(&self) -> Result<Box<dyn Connection>, DbError> {
    let mut conn = self.connector.connect().await?;

    if let Err(e) = conn.configure_session(&self.session).await {
      tracing::warn!(target_db = %self.connector.describe(), "session tuning failed: {}", e);
    }
    for sql in &self.prepared {
      if let Err(e) = conn.prepare(sql).await {
        tracing::warn!("statement pre-registration failed: {}", e);
      }
    }

    tracing::debug!(target_db = %self.connector.describe(), "opened connection");
    Ok(conn)
  }

  async fn recycle(&self, conn: &mut Box<dyn Connection>, _: &Metrics) -> RecycleResult<DbError> {
    if conn.in_transaction() {
      tracing::warn!("connection returned inside an open transaction, rolling back");
      conn.rollback().await.map_err(RecycleError::Backend)?;
    }
    if !conn.is_valid().await {
      return Err(RecycleError::Backend(DbError::Connect(
        "connection no longer usable".into(),
      )));
    }
    Ok(())
  }
}

pub type PooledConnection = Object<ConnectorManager>;

/// Point-in-time view of one pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
  pub total_connections: usize,
  pub active_connections: usize,
  pub idle_connections: usize,
  pub max_connections: usize,
  pub waiting: usize,
  pub total_queries: u64,
  pub failed_queries: u64,
  pub acquisitions: u64,
  pub acquire_timeouts: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolManagerStats {
  pub state: PoolState,
  pub write: Option<PoolStats>,
  /// `None` when reads share the write pool
  pub read: Option<PoolStats>,
}

/// One role's pool plus its counters
pub struct ConnectionPool {
  intent: PoolIntent,
  pool: managed::Pool<ConnectorManager>,
  dialect: SqlDialect,
  min_size: usize,
  /// Whole budget for one checkout: waiting, opening and recycling
  connect_timeout: Duration,
  total_queries: AtomicU64,
  failed_queries: AtomicU64,
  acquisitions: AtomicU64,
  acquire_timeouts: AtomicU64,
}

impl ConnectionPool {
  fn build(intent: PoolIntent, connector: Arc<dyn Connector>, config: &PoolConfig) -> Result<Self, DbError> {
    let dialect = connector.dialect();
    let manager = ConnectorManager {
      connector,
      session: config.session_settings(),
      prepared: config.prepared_statements.clone(),
    };
    let pool = managed::Pool::builder(manager)
      .max_size(config.max_size)
      .runtime(Runtime::Tokio1)
      .build()
      .map_err(|e| DbError::Config(e.to_string()))?;

    Ok(Self {
      intent,
      pool,
      dialect,
      min_size: config.min_size,
      connect_timeout: config.connect_timeout(),
      total_queries: AtomicU64::new(0),
      failed_queries: AtomicU64::new(0),
      acquisitions: AtomicU64::new(0),
      acquire_timeouts: AtomicU64::new(0),
    })
  }

  /// Open `min_size` connections at once; any failure aborts
  async fn prewarm(&self) -> Result<(), DbError> {
    let started = Instant::now();
    let results = join_all(
      (0..self.min_size).map(|_| tokio::time::timeout(self.connect_timeout, self.pool.get())),
    )
    .await;
    for result in results {
      // returns to the pool as idle when the binding drops
      let _conn = match result {
        Ok(conn) => conn.map_err(|e| self.map_error(e))?,
        Err(_) => {
          return Err(DbError::Connect(format!(
            "opening {} connections took longer than {}ms",
            self.min_size,
            started.elapsed().as_millis()
          )));
        }
      };
    }
    Ok(())
  }

  /// Check out a connection; waiting for a slot, opening a connection and
  /// recycling an idle one all share `connect_timeout`
  pub async fn acquire(&self) -> Result<PooledConnection, DbError> {
    let started = Instant::now();
    self.acquisitions.fetch_add(1, Ordering::Relaxed);

    match tokio::time::timeout(self.connect_timeout, self.pool.get()).await {
      Ok(result) => result.map_err(|e| self.map_error(e)),
      Err(_) => {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
        let waited_ms = started.elapsed().as_millis() as u64;
        tracing::warn!(intent = %self.intent, waited_ms, "connection pool exhausted");
        Err(DbError::PoolExhausted {
          intent: self.intent,
          waited_ms,
        })
      }
    }
  }

  fn map_error(&self, err: PoolError<DbError>) -> DbError {
    match err {
      PoolError::Timeout(kind) => DbError::Connect(format!("{:?} timed out", kind)),
      PoolError::Backend(e) => e,
      PoolError::Closed => DbError::PoolClosed,
      other => DbError::Connect(other.to_string()),
    }
  }

  pub fn intent(&self) -> PoolIntent {
    self.intent
  }

  pub fn dialect(&self) -> SqlDialect {
    self.dialect
  }

  pub fn record_query(&self, succeeded: bool) {
    self.total_queries.fetch_add(1, Ordering::Relaxed);
    if !succeeded {
      self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn stats(&self) -> PoolStats {
    let status = self.pool.status();
    PoolStats {
      total_connections: status.size,
      active_connections: status.size.saturating_sub(status.available),
      idle_connections: status.available,
      max_connections: status.max_size,
      waiting: status.waiting,
      total_queries: self.total_queries.load(Ordering::Relaxed),
      failed_queries: self.failed_queries.load(Ordering::Relaxed),
      acquisitions: self.acquisitions.load(Ordering::Relaxed),
      acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
    }
  }

  /// Close idle connections unused for `max_idle`, keeping `min_size` open
  pub fn reap_idle(&self, max_idle: Duration) -> usize {
    let status = self.pool.status();
    let removable = AtomicUsize::new(status.size.saturating_sub(self.min_size));
    let removed = AtomicUsize::new(0);

    self.pool.retain(|_, metrics: Metrics| {
      if metrics.last_used() < max_idle {
        return true;
      }
      let left = removable.load(Ordering::Relaxed);
      if left == 0 {
        return true;
      }
      removable.store(left - 1, Ordering::Relaxed);
      removed.fetch_add(1, Ordering::Relaxed);
      false
    });

    removed.into_inner()
  }

  fn close(&self) {
    self.pool.close();
  }
}

struct Pools {
  write: Arc<ConnectionPool>,
  read: Arc<ConnectionPool>,
  aliased: bool,
}

struct Reaper {
  token: CancellationToken,
  handle: JoinHandle<()>,
}

/// Owns the read and write pools and their lifecycle
pub struct ConnectionPoolManager {
  state: RwLock<PoolState>,
  pools: RwLock<Option<Pools>>,
  config: RwLock<PoolConfig>,
  reaper: Mutex<Option<Reaper>>,
}

impl Default for ConnectionPoolManager {
  fn default() -> Self {
    Self::new()
  }
}

impl ConnectionPoolManager {
  pub fn new() -> Self {
    Self {
      state: RwLock::new(PoolState::Uninitialized),
      pools: RwLock::new(None),
      config: RwLock::new(PoolConfig::default()),
      reaper: Mutex::new(None),
    }
  }

  pub fn state(&self) -> PoolState {
    *self.state.read()
  }

  pub fn config(&self) -> PoolConfig {
    self.config.read().clone()
  }

  /// Build pools for `dsn` (and the configured read replica)
  pub async fn initialize(&self, dsn: &str, config: PoolConfig) -> Result<(), DbError> {
    let write = connector_for(dsn)?;
    let read = match config.read_replica_url.as_deref().filter(|u| !u.is_empty()) {
      Some(url) => Some(connector_for(url)?),
      None => None,
    };
    self.initialize_with(write, read, config).await
  }

  /// Build pools from explicit connectors. `read == None` aliases the read
  /// pool to the write pool.
  pub async fn initialize_with(
    &self,
    write: Arc<dyn Connector>,
    read: Option<Arc<dyn Connector>>,
    config: PoolConfig,
  ) -> Result<(), DbError> {
    config.validate()?;
    {
      let mut state = self.state.write();
      match *state {
        PoolState::Uninitialized => *state = PoolState::Initializing,
        PoolState::Draining | PoolState::Closed => return Err(DbError::PoolClosed),
        other => {
          return Err(DbError::Config(format!(
            "pool manager already {}",
            other
          )))
        }
      }
    }

    tracing::info!(
      write = %write.describe(),
      read = %read.as_ref().map(|c| c.describe()).unwrap_or_else(|| "shared".into()),
      min = config.min_size,
      max = config.max_size,
      "initializing connection pools"
    );

    let pools = match Self::build_pools(write, read, &config).await {
      Ok(pools) => pools,
      Err(e) => {
        let mut state = self.state.write();
        if *state == PoolState::Initializing {
          *state = PoolState::Uninitialized;
        }
        tracing::error!("connection pool initialization failed: {}", e);
        return Err(e);
      }
    };

    {
      let mut state = self.state.write();
      if *state != PoolState::Initializing {
        // closed while we were connecting
        pools.write.close();
        pools.read.close();
        return Err(DbError::PoolClosed);
      }
      *self.pools.write() = Some(Pools {
        write: pools.write.clone(),
        read: pools.read.clone(),
        aliased: pools.aliased,
      });
      *self.config.write() = config.clone();
      *state = PoolState::Ready;
    }

    self.start_reaper(&pools, config.max_idle_time());
    tracing::info!("connection pools ready");
    Ok(())
  }

  async fn build_pools(
    write: Arc<dyn Connector>,
    read: Option<Arc<dyn Connector>>,
    config: &PoolConfig,
  ) -> Result<Pools, DbError> {
    let write_pool = Arc::new(ConnectionPool::build(PoolIntent::Write, write, config)?);
    let read_pool = match read {
      Some(connector) => Some(Arc::new(ConnectionPool::build(PoolIntent::Read, connector, config)?)),
      None => None,
    };

    let warmed = match &read_pool {
      Some(read_pool) => {
        let (w, r) = tokio::join!(write_pool.prewarm(), read_pool.prewarm());
        w.and(r)
      }
      None => write_pool.prewarm().await,
    };
    if let Err(e) = warmed {
      write_pool.close();
      if let Some(read_pool) = &read_pool {
        read_pool.close();
      }
      return Err(e);
    }

    Ok(match read_pool {
      Some(read_pool) => Pools {
        write: write_pool,
        read: read_pool,
        aliased: false,
      },
      None => Pools {
        read: write_pool.clone(),
        write: write_pool,
        aliased: true,
      },
    })
  }

  fn start_reaper(&self, pools: &Pools, max_idle: Duration) {
    let token = CancellationToken::new();
    let period = (max_idle / 2).clamp(Duration::from_secs(1), Duration::from_secs(30));
    let write = pools.write.clone();
    let read = (!pools.aliased).then(|| pools.read.clone());
    let cancelled = token.clone();

    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      interval.tick().await;
      loop {
        tokio::select! {
          _ = cancelled.cancelled() => break,
          _ = interval.tick() => {
            let mut closed = write.reap_idle(max_idle);
            if let Some(read) = &read {
              closed += read.reap_idle(max_idle);
            }
            if closed > 0 {
              tracing::debug!(closed, "closed idle connections");
            }
          }
        }
      }
    });

    *self.reaper.lock() = Some(Reaper { token, handle });
  }

  /// Pool serving `intent`
  pub fn get_pool(&self, intent: PoolIntent) -> Result<Arc<ConnectionPool>, DbError> {
    match self.state() {
      PoolState::Ready => {}
      PoolState::Draining | PoolState::Closed => return Err(DbError::PoolClosed),
      other => return Err(DbError::PoolNotReady(other)),
    }
    let pools = self.pools.read();
    let pools = pools.as_ref().ok_or(DbError::PoolNotReady(PoolState::Uninitialized))?;
    Ok(match intent {
      PoolIntent::Read => pools.read.clone(),
      PoolIntent::Write => pools.write.clone(),
    })
  }

  /// Check out a connection; it goes back to its pool when dropped
  pub async fn acquire(&self, intent: PoolIntent) -> Result<PooledConnection, DbError> {
    self.get_pool(intent)?.acquire().await
  }

  pub fn dialect(&self) -> Option<SqlDialect> {
    self.pools.read().as_ref().map(|p| p.write.dialect())
  }

  pub fn stats(&self) -> PoolManagerStats {
    let pools = self.pools.read();
    PoolManagerStats {
      state: self.state(),
      write: pools.as_ref().map(|p| p.write.stats()),
      read: pools
        .as_ref()
        .filter(|p| !p.aliased)
        .map(|p| p.read.stats()),
    }
  }

  /// Stop handing out connections and close both pools. Connections already
  /// checked out finish normally and are discarded on return.
  pub async fn close(&self) {
    {
      let mut state = self.state.write();
      match *state {
        PoolState::Draining | PoolState::Closed => return,
        PoolState::Uninitialized | PoolState::Initializing => {
          *state = PoolState::Closed;
          return;
        }
        PoolState::Ready => *state = PoolState::Draining,
      }
    }

    let reaper = self.reaper.lock().take();
    if let Some(reaper) = reaper {
      reaper.token.cancel();
      let _ = reaper.handle.await;
    }

    if let Some(pools) = self.pools.read().as_ref() {
      pools.write.close();
      if !pools.aliased {
        pools.read.close();
      }
    }

    *self.state.write() = PoolState::Closed;
    tracing::info!("connection pools closed");
  }
}
