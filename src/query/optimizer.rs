use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::advisor::{index_columns, IndexAdvisor, IndexSuggestion};
use super::rewrite::{bare_table, is_write, limit_primary_key_lookup, normalize_whitespace, tables_in};
use super::stats::{QueryRecord, QueryStats, SlowQueryRecord};
use crate::cache::{escape_glob, CacheKey, CacheManager, Invalidation};
use crate::db::{
  validate_identifier, ConnectionPool, ConnectionPoolManager, DbError, PoolIntent, PoolManagerStats,
  PooledConnection, QueryResult, SqlDialect, SqlValue,
};

/// Scope prefix of cached query results
const QUERY_SCOPE: &str = "query";

/// How one call to [`QueryOptimizer::execute`] should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  pub intent: PoolIntent,
  /// Only honored for reads
  pub use_cache: bool,
  /// `None` uses the cache default
  pub cache_ttl: Option<Duration>,
}

impl QueryOptions {
  pub fn read() -> Self {
    Self {
      intent: PoolIntent::Read,
      use_cache: true,
      cache_ttl: None,
    }
  }

  pub fn write() -> Self {
    Self {
      intent: PoolIntent::Write,
      use_cache: false,
      cache_ttl: None,
    }
  }

  pub fn no_cache(mut self) -> Self {
    self.use_cache = false;
    self
  }

  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = Some(ttl);
    self
  }
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self::read()
  }
}

/// One statement of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
  pub sql: String,
  #[serde(default)]
  pub params: Vec<SqlValue>,
}

impl Statement {
  pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
    Self {
      sql: sql.into(),
      params,
    }
  }
}

/// An index the advisor should treat as already present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownIndex {
  pub table: String,
  pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
  #[serde(default = "default_slow_query_threshold_ms")]
  pub slow_query_threshold_ms: u64,

  /// Slow queries retained for diagnostics
  #[serde(default = "default_slow_query_log_size")]
  pub slow_query_log_size: usize,

  /// Tables considered for index suggestions
  #[serde(default = "default_hot_tables")]
  pub hot_tables: Vec<String>,

  /// Drop cached reads of a table after a successful write to it
  #[serde(default = "default_invalidate_on_write")]
  pub invalidate_on_write: bool,

  #[serde(default)]
  pub known_indexes: Vec<KnownIndex>,
}

fn default_slow_query_threshold_ms() -> u64 {
  1000
}

fn default_slow_query_log_size() -> usize {
  100
}

fn default_hot_tables() -> Vec<String> {
  vec!["messages".into(), "conversations".into(), "users".into()]
}

fn default_invalidate_on_write() -> bool {
  true
}

impl Default for OptimizerConfig {
  fn default() -> Self {
    Self {
      slow_query_threshold_ms: default_slow_query_threshold_ms(),
      slow_query_log_size: default_slow_query_log_size(),
      hot_tables: default_hot_tables(),
      invalidate_on_write: default_invalidate_on_write(),
      known_indexes: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceFailure {
  /// Table name, or `database` for a whole-database step
  pub target: String,
  pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
  pub succeeded: Vec<String>,
  pub failed: Vec<MaintenanceFailure>,
}

/// Runs statements through the cache and the connection pools.
///
/// Reads are answered from the cache when possible. Everything that reaches
/// the database is timed per statement shape, and slow statements are kept
/// for index analysis.
pub struct QueryOptimizer {
  pools: Arc<ConnectionPoolManager>,
  cache: Arc<CacheManager>,
  config: OptimizerConfig,
  stats: QueryStats,
  advisor: IndexAdvisor,
}

impl QueryOptimizer {
  pub fn new(pools: Arc<ConnectionPoolManager>, cache: Arc<CacheManager>, config: OptimizerConfig) -> Self {
    let advisor = IndexAdvisor::new(&config.hot_tables);
    for index in &config.known_indexes {
      advisor.register(&index.table, &index.columns);
    }
    Self {
      stats: QueryStats::new(config.slow_query_log_size),
      pools,
      cache,
      config,
      advisor,
    }
  }

  pub fn config(&self) -> &OptimizerConfig {
    &self.config
  }

  pub fn cache(&self) -> &Arc<CacheManager> {
    &self.cache
  }

  pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
    &self.pools
  }

  fn cache_key(&self, shape: &str, params: &[SqlValue]) -> Option<CacheKey> {
    match CacheKey::derive(&query_scope(shape), shape, params, &[]) {
      Ok(key) => Some(key),
      Err(e) => {
        tracing::warn!(shape = %shape, "could not derive cache key: {}", e);
        None
      }
    }
  }

  /// Run one statement.
  ///
  /// Cacheable reads are looked up first and a hit never touches a pool.
  /// Statements that modify data always use the write pool, whatever the
  /// requested intent. Cache failures only cost a database round trip.
  pub async fn execute(
    &self,
    sql: &str,
    params: &[SqlValue],
    options: QueryOptions,
  ) -> Result<QueryResult, DbError> {
    let shape = normalize_whitespace(sql);
    let write = options.intent == PoolIntent::Write || is_write(&shape);
    let key = if options.use_cache && !write {
      self.cache_key(&shape, params)
    } else {
      None
    };

    if let Some(key) = &key {
      if let Some(cached) = self.cache.get::<QueryResult>(key).await {
        self.stats.record_cache_hit(&shape, params);
        tracing::debug!(shape = %shape, "query served from cache");
        return Ok(cached);
      }
    }

    let intent = if write { PoolIntent::Write } else { options.intent };
    let pool = self.pools.get_pool(intent)?;
    let result = {
      let mut conn = pool.acquire().await?;
      self.run(&pool, &mut conn, &shape, params, key.is_some()).await?
    };

    if let Some(key) = &key {
      if result.has_non_finite() {
        tracing::debug!(shape = %shape, "result holds NaN or infinity, not cached");
      } else if let Err(e) = self.cache.set(key, &result, options.cache_ttl).await {
        tracing::warn!(shape = %shape, "query result not cached: {}", e);
      }
    } else if is_write(&shape) {
      self.invalidate_written(&shape).await;
    }
    Ok(result)
  }

  /// [`execute`](Self::execute) with every row decoded into `T`
  pub async fn fetch_as<T: DeserializeOwned>(
    &self,
    sql: &str,
    params: &[SqlValue],
    options: QueryOptions,
  ) -> Result<Vec<T>, DbError> {
    self.execute(sql, params, options).await?.decode()
  }

  /// Run several statements on one write connection.
  ///
  /// With `use_transaction` they apply together or not at all: the first
  /// failure rolls back and is returned as `TransactionFailed` with its
  /// position. Without it every statement runs on its own and reports its
  /// own result.
  pub async fn execute_batch(
    &self,
    statements: &[Statement],
    use_transaction: bool,
  ) -> Result<Vec<Result<QueryResult, DbError>>, DbError> {
    let pool = self.pools.get_pool(PoolIntent::Write)?;
    let mut conn = pool.acquire().await?;

    if !use_transaction {
      let mut results = Vec::with_capacity(statements.len());
      for statement in statements {
        let shape = normalize_whitespace(&statement.sql);
        let result = self
          .run(&pool, &mut conn, &shape, &statement.params, false)
          .await;
        if result.is_ok() && is_write(&shape) {
          self.invalidate_written(&shape).await;
        }
        results.push(result);
      }
      return Ok(results);
    }

    conn.begin().await?;
    let mut results = Vec::with_capacity(statements.len());
    for (index, statement) in statements.iter().enumerate() {
      let shape = normalize_whitespace(&statement.sql);
      match self
        .run(&pool, &mut conn, &shape, &statement.params, false)
        .await
      {
        Ok(result) => results.push(result),
        Err(e) => {
          if let Err(rollback) = conn.rollback().await {
            tracing::error!(index, "rollback after failed statement also failed: {}", rollback);
          }
          tracing::warn!(index, shape = %shape, "batch rolled back: {}", e);
          return Err(DbError::TransactionFailed {
            index,
            source: Box::new(e),
          });
        }
      }
    }
    conn.commit().await?;
    drop(conn);

    for statement in statements {
      let shape = normalize_whitespace(&statement.sql);
      if is_write(&shape) {
        self.invalidate_written(&shape).await;
      }
    }
    Ok(results.into_iter().map(Ok).collect())
  }

  /// Execute on an acquired connection, recording timing and slow queries
  async fn run(
    &self,
    pool: &ConnectionPool,
    conn: &mut PooledConnection,
    shape: &str,
    params: &[SqlValue],
    cacheable: bool,
  ) -> Result<QueryResult, DbError> {
    let sql = limit_primary_key_lookup(shape);
    let timeout = self.pools.config().command_timeout();

    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, conn.query(&sql, params)).await {
      Ok(result) => result,
      Err(_) => Err(DbError::timeout(shape, timeout.as_millis() as u64)),
    };
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    pool.record_query(outcome.is_ok());
    self
      .stats
      .record_execution(shape, params, elapsed_ms, cacheable);

    if elapsed_ms > self.config.slow_query_threshold_ms as f64 {
      tracing::warn!(
        shape = %shape,
        elapsed_ms,
        threshold_ms = self.config.slow_query_threshold_ms,
        "slow query"
      );
      self.stats.record_slow(SlowQueryRecord {
        query_shape: shape.to_string(),
        params: params.to_vec(),
        execution_time_ms: elapsed_ms,
        timestamp: Utc::now(),
      });
    }

    if let Err(e) = &outcome {
      tracing::debug!(shape = %shape, "query failed: {}", e);
    }
    outcome
  }

  async fn invalidate_written(&self, shape: &str) {
    if !self.config.invalidate_on_write {
      return;
    }
    for table in tables_in(shape) {
      self.invalidate_table(&table).await;
    }
  }

  /// Drop every cached read that touched `table`, with or without a schema
  /// qualifier
  pub async fn invalidate_table(&self, table: &str) -> usize {
    let table = bare_table(table).to_ascii_lowercase();
    self
      .cache
      .invalidate(Invalidation::pattern(format!(
        "{}:*|{}|*",
        QUERY_SCOPE,
        escape_glob(&table)
      )))
      .await
  }

  // -- diagnostics --

  /// Per-shape records, most expensive first
  pub fn query_stats(&self) -> Vec<QueryRecord> {
    self.stats.records()
  }

  pub fn slow_queries(&self) -> Vec<SlowQueryRecord> {
    self.stats.slow_queries()
  }

  pub fn reset_stats(&self) {
    self.stats.reset();
  }

  pub fn pool_stats(&self) -> PoolManagerStats {
    self.pools.stats()
  }

  // -- index advice --

  /// `CREATE INDEX` statements suggested by the slow query log
  pub fn suggest_indexes(&self) -> Vec<String> {
    self
      .index_suggestions()
      .into_iter()
      .map(|s| s.statement)
      .collect()
  }

  pub fn index_suggestions(&self) -> Vec<IndexSuggestion> {
    let dialect = self.pools.dialect().unwrap_or(SqlDialect::Postgres);
    self.advisor.suggest(&self.stats.slow_queries(), dialect)
  }

  /// Mark an existing index so it is not suggested again
  pub fn register_index(&self, table: &str, columns: &[&str]) {
    let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    self.advisor.register(table, &columns);
  }

  /// Read the catalog and register every existing index. Returns how many
  /// distinct column pairs are now known.
  pub async fn load_existing_indexes(&self) -> Result<usize, DbError> {
    let pool = self.pools.get_pool(PoolIntent::Read)?;
    let sql = match pool.dialect() {
      SqlDialect::Postgres => {
        "SELECT tablename AS table_name, indexdef AS definition FROM pg_indexes \
         WHERE schemaname NOT IN ('pg_catalog', 'information_schema')"
      }
      SqlDialect::Sqlite => {
        "SELECT tbl_name AS table_name, sql AS definition FROM sqlite_master \
         WHERE type = 'index' AND sql IS NOT NULL"
      }
    };

    let result = {
      let mut conn = pool.acquire().await?;
      conn.query(sql, &[]).await?
    };
    for row in &result.rows {
      let table = row.get("table_name").and_then(SqlValue::as_str);
      let definition = row.get("definition").and_then(SqlValue::as_str);
      if let (Some(table), Some(definition)) = (table, definition) {
        self.advisor.register(table, &index_columns(definition));
      }
    }

    let known = self.advisor.known_count();
    tracing::info!(indexes = result.rows.len(), known, "existing indexes loaded");
    Ok(known)
  }

  // -- maintenance --

  /// Refresh planner statistics and reclaim space for `tables`.
  ///
  /// PostgreSQL gets `VACUUM (ANALYZE)` per table; SQLite gets `ANALYZE` per
  /// table followed by one database-wide `VACUUM`. A failing table is
  /// recorded and the rest still run.
  pub async fn maintenance(&self, tables: &[&str]) -> Result<MaintenanceReport, DbError> {
    let pool = self.pools.get_pool(PoolIntent::Write)?;
    let dialect = pool.dialect();
    let mut conn = pool.acquire().await?;
    let mut report = MaintenanceReport::default();

    for table in tables {
      if let Err(e) = validate_identifier(table) {
        tracing::warn!(table = %table, "skipping maintenance: {}", e);
        report.failed.push(MaintenanceFailure {
          target: table.to_string(),
          error: e.to_string(),
        });
        continue;
      }

      let sql = match dialect {
        SqlDialect::Postgres => format!("VACUUM (ANALYZE) {}", table),
        SqlDialect::Sqlite => format!("ANALYZE {}", table),
      };
      match conn.batch_execute(&sql).await {
        Ok(()) => {
          tracing::info!(table = %table, "maintenance complete");
          report.succeeded.push(table.to_string());
        }
        Err(e) => {
          tracing::warn!(table = %table, "maintenance failed: {}", e);
          report.failed.push(MaintenanceFailure {
            target: table.to_string(),
            error: e.to_string(),
          });
        }
      }
    }

    if dialect == SqlDialect::Sqlite {
      if let Err(e) = conn.batch_execute("VACUUM").await {
        tracing::warn!("VACUUM failed: {}", e);
        report.failed.push(MaintenanceFailure {
          target: "database".to_string(),
          error: e.to_string(),
        });
      }
    }
    Ok(report)
  }
}

/// `query:|a|b|` listing every table the read touches, schema stripped and
/// sorted, so a write to any of them matches `query:*|a|*`. Statements
/// without a table share the bare `query` scope.
fn query_scope(shape: &str) -> String {
  let mut tables: Vec<String> = tables_in(shape)
    .iter()
    .map(|t| bare_table(t).to_string())
    .collect();
  if tables.is_empty() {
    return QUERY_SCOPE.to_string();
  }
  tables.sort();
  tables.dedup();
  format!("{}:|{}|", QUERY_SCOPE, tables.join("|"))
}
