mod common;

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use common::{cache_config, pool_config, FakeConnector, FakeDb};
use tierdb::cache::CacheManager;
use tierdb::db::{ConnectionPoolManager, DbError, PoolConfig, SqlValue};
use tierdb::query::{OptimizerConfig, QueryOptimizer, QueryOptions, Statement};

async fn fake_optimizer(db: &Arc<FakeDb>, config: OptimizerConfig, pool: PoolConfig) -> QueryOptimizer {
  let pools = Arc::new(ConnectionPoolManager::new());
  pools
    .initialize_with(FakeConnector::new(db), None, pool)
    .await
    .unwrap();
  QueryOptimizer::new(pools, Arc::new(CacheManager::new(cache_config(100))), config)
}

async fn sqlite_optimizer(dir: &TempDir, config: OptimizerConfig) -> QueryOptimizer {
  let path = dir.path().join("chat.db");
  let pools = Arc::new(ConnectionPoolManager::new());
  pools
    .initialize(&format!("sqlite://{}", path.display()), pool_config(1, 2))
    .await
    .unwrap();
  let optimizer = QueryOptimizer::new(pools, Arc::new(CacheManager::new(cache_config(100))), config);
  optimizer
    .execute(
      "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
      &[],
      QueryOptions::write(),
    )
    .await
    .unwrap();
  optimizer
    .execute(
      "CREATE TABLE messages (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL, body TEXT)",
      &[],
      QueryOptions::write(),
    )
    .await
    .unwrap();
  optimizer
}

fn acquisitions(optimizer: &QueryOptimizer) -> u64 {
  optimizer.pool_stats().write.unwrap().acquisitions
}

#[tokio::test]
async fn test_cached_read_skips_the_pool() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;
  let sql = "SELECT * FROM messages WHERE conversation_id = $1";
  let params = [SqlValue::Int(7)];

  let first = optimizer.execute(sql, &params, QueryOptions::read()).await.unwrap();
  let before = acquisitions(&optimizer);
  let second = optimizer.execute(sql, &params, QueryOptions::read()).await.unwrap();

  assert_eq!(first, second);
  assert_eq!(db.query_count(), 1);
  assert_eq!(acquisitions(&optimizer), before);

  let records = optimizer.query_stats();
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].count, 1);
  assert_eq!(records[0].cache_hits, 1);
  assert_eq!(records[0].cache_misses, 1);
}

#[tokio::test]
async fn test_different_params_are_cached_separately() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;
  let sql = "SELECT * FROM messages WHERE conversation_id = $1";

  optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  optimizer.execute(sql, &[SqlValue::Int(2)], QueryOptions::read()).await.unwrap();
  // whitespace differences normalize to the same shape
  optimizer
    .execute("SELECT *\n  FROM messages WHERE conversation_id = $1", &[SqlValue::Int(1)], QueryOptions::read())
    .await
    .unwrap();
  assert_eq!(db.query_count(), 2);
}

#[tokio::test]
async fn test_no_cache_and_writes_always_hit_the_database() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;
  let sql = "SELECT * FROM users";

  optimizer.execute(sql, &[], QueryOptions::read().no_cache()).await.unwrap();
  optimizer.execute(sql, &[], QueryOptions::read().no_cache()).await.unwrap();
  optimizer.execute(sql, &[], QueryOptions::write()).await.unwrap();
  assert_eq!(db.query_count(), 3);
  assert_eq!(optimizer.cache().stats().items, 0);
}

#[tokio::test]
async fn test_write_invalidates_cached_reads_of_its_table() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;
  let history = "SELECT * FROM messages WHERE conversation_id = $1";
  let joined = "SELECT m.body, u.name FROM messages m JOIN users u ON u.id = m.user_id";
  let profile = "SELECT * FROM conversations WHERE owner_id = $1";

  for sql in [history, joined, profile] {
    optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  }
  assert_eq!(db.query_count(), 3);

  optimizer
    .execute("UPDATE users SET name = $1 WHERE id = $2", &["bo".into(), SqlValue::Int(2)], QueryOptions::write())
    .await
    .unwrap();
  assert_eq!(db.query_count(), 4);

  // only the join touched users
  for sql in [history, joined, profile] {
    optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  }
  assert_eq!(db.query_count(), 5);

  optimizer
    .execute("INSERT INTO messages (body) VALUES ($1)", &["hi".into()], QueryOptions::write())
    .await
    .unwrap();
  for sql in [history, joined, profile] {
    optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  }
  assert_eq!(db.query_count(), 8);
}

#[tokio::test]
async fn test_write_with_read_intent_is_not_cached() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;
  let sql = "DELETE FROM messages WHERE id = $1";

  optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  assert_eq!(db.query_count(), 2);
}

#[tokio::test]
async fn test_primary_key_lookup_gets_a_limit() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;

  optimizer
    .execute("SELECT * FROM users WHERE id = $1", &[SqlValue::Int(1)], QueryOptions::read())
    .await
    .unwrap();
  assert_eq!(db.log(), vec!["SELECT * FROM users WHERE id = $1 LIMIT 1"]);
  // stats keep the shape as written
  assert_eq!(optimizer.query_stats()[0].query_shape, "SELECT * FROM users WHERE id = $1");
}

#[tokio::test]
async fn test_execution_errors_surface_and_are_not_cached() {
  let db = FakeDb::new();
  db.fail_on("broken");
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;

  let err = optimizer
    .execute("SELECT * FROM broken", &[], QueryOptions::read())
    .await
    .unwrap_err();
  assert!(matches!(err, DbError::Execution { .. }));
  assert!(!err.is_retryable());
  assert_eq!(optimizer.cache().stats().items, 0);
  assert_eq!(optimizer.pool_stats().write.unwrap().failed_queries, 1);
}

#[tokio::test]
async fn test_command_timeout_returns_the_connection() {
  let db = FakeDb::new();
  let pool = PoolConfig {
    command_timeout_ms: 50,
    ..pool_config(1, 1)
  };
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool).await;

  db.set_delay(Duration::from_millis(500));
  let err = optimizer
    .execute("SELECT * FROM messages", &[], QueryOptions::read())
    .await
    .unwrap_err();
  assert!(matches!(err, DbError::QueryTimeout { timeout_ms: 50, .. }), "got {:?}", err);

  db.set_delay(Duration::ZERO);
  optimizer
    .execute("SELECT * FROM messages", &[], QueryOptions::read())
    .await
    .unwrap();
  let stats = optimizer.pool_stats().write.unwrap();
  assert_eq!(stats.total_connections, 1);
  assert_eq!(stats.acquire_timeouts, 0);
}

#[tokio::test]
async fn test_cancelled_execute_returns_the_connection() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 1)).await;

  db.set_delay(Duration::from_millis(500));
  let abandoned = tokio::time::timeout(
    Duration::from_millis(30),
    optimizer.execute("SELECT * FROM messages", &[], QueryOptions::read()),
  )
  .await;
  assert!(abandoned.is_err());

  db.set_delay(Duration::ZERO);
  optimizer
    .execute("SELECT * FROM users", &[], QueryOptions::read())
    .await
    .unwrap();
  let stats = optimizer.pool_stats().write.unwrap();
  assert_eq!(stats.total_connections, 1);
  assert_eq!(stats.acquire_timeouts, 0);
}

#[tokio::test]
async fn test_cancelled_batch_is_rolled_back() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 1)).await;
  let statements = vec![Statement::new("INSERT INTO messages (body) VALUES ($1)", vec!["a".into()])];

  db.set_delay(Duration::from_millis(500));
  let abandoned = tokio::time::timeout(Duration::from_millis(30), optimizer.execute_batch(&statements, true)).await;
  assert!(abandoned.is_err());

  db.set_delay(Duration::ZERO);
  optimizer
    .execute("SELECT * FROM users", &[], QueryOptions::read())
    .await
    .unwrap();
  assert_eq!(db.log(), vec!["BEGIN", "ROLLBACK", "SELECT * FROM users"]);
}

#[tokio::test]
async fn test_concurrent_execute_on_a_full_pool() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 1)).await;
  db.set_delay(Duration::from_millis(500));

  let started = Instant::now();
  let slow = optimizer.execute("SELECT * FROM messages", &[], QueryOptions::read());
  let starved = async {
    tokio::time::sleep(Duration::from_millis(10)).await;
    let result = optimizer.execute("SELECT * FROM users", &[], QueryOptions::read()).await;
    (result, started.elapsed())
  };
  let (slow, (starved, gave_up_after)) = tokio::join!(slow, starved);

  assert!(slow.is_ok());
  assert!(matches!(starved, Err(DbError::PoolExhausted { .. })), "got {:?}", starved);
  assert!(gave_up_after < Duration::from_millis(400), "gave up after {:?}", gave_up_after);
  assert_eq!(optimizer.pool_stats().write.unwrap().acquire_timeouts, 1);
  assert_eq!(db.query_count(), 1);
}

#[tokio::test]
async fn test_select_with_write_intent_keeps_cached_reads() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;
  let history = "SELECT * FROM messages WHERE conversation_id = $1";

  optimizer.execute(history, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  // read-your-writes lookup routed to the primary
  optimizer
    .execute("SELECT * FROM messages WHERE id = $1", &[SqlValue::Int(9)], QueryOptions::write())
    .await
    .unwrap();
  assert_eq!(db.query_count(), 2);

  optimizer.execute(history, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  assert_eq!(db.query_count(), 2);
  assert_eq!(optimizer.cache().stats().items, 1);
}

#[tokio::test]
async fn test_schema_qualified_tables_share_invalidation() {
  let db = FakeDb::new();
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;
  let qualified = "SELECT * FROM public.messages WHERE conversation_id = $1";
  let bare = "SELECT * FROM Messages WHERE user_id = $1";

  for sql in [qualified, bare] {
    optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  }
  optimizer
    .execute("INSERT INTO messages (body) VALUES ($1)", &["hi".into()], QueryOptions::write())
    .await
    .unwrap();
  assert_eq!(db.query_count(), 3);
  for sql in [qualified, bare] {
    optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  }
  assert_eq!(db.query_count(), 5);

  optimizer
    .execute("DELETE FROM public.messages WHERE id = $1", &[SqlValue::Int(1)], QueryOptions::write())
    .await
    .unwrap();
  for sql in [qualified, bare] {
    optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  }
  assert_eq!(db.query_count(), 8);
}

#[tokio::test]
async fn test_non_finite_results_are_not_cached() {
  let dir = TempDir::new().unwrap();
  let optimizer = sqlite_optimizer(&dir, OptimizerConfig::default()).await;
  let sql = "SELECT 9e999 AS ratio";

  for _ in 0..2 {
    let result = optimizer.execute(sql, &[], QueryOptions::read()).await.unwrap();
    assert_eq!(result.rows[0].get("ratio"), Some(&SqlValue::Float(f64::INFINITY)));
  }
  assert_eq!(optimizer.cache().stats().items, 0);
  let record = optimizer
    .query_stats()
    .into_iter()
    .find(|r| r.query_shape == sql)
    .unwrap();
  assert_eq!(record.count, 2);
  assert_eq!(record.cache_hits, 0);
}

#[tokio::test]
async fn test_slow_queries_are_logged_and_indexed() {
  let db = FakeDb::new();
  let config = OptimizerConfig {
    slow_query_threshold_ms: 10,
    ..OptimizerConfig::default()
  };
  let optimizer = fake_optimizer(&db, config, pool_config(1, 2)).await;
  let slow = "SELECT * FROM messages WHERE conversation_id = $1 ORDER BY created_at DESC LIMIT 50";

  optimizer.execute("SELECT 1", &[], QueryOptions::read()).await.unwrap();
  db.set_delay(Duration::from_millis(30));
  optimizer.execute(slow, &[SqlValue::Int(3)], QueryOptions::read()).await.unwrap();

  let log = optimizer.slow_queries();
  assert_eq!(log.len(), 1);
  assert_eq!(log[0].query_shape, slow);
  assert_eq!(log[0].params, vec![SqlValue::Int(3)]);
  assert!(log[0].execution_time_ms >= 30.0);

  assert_eq!(
    optimizer.suggest_indexes(),
    vec![
      "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_messages_conversation_id_created_at ON messages (conversation_id, created_at DESC)"
    ]
  );

  optimizer.register_index("messages", &["conversation_id", "created_at"]);
  assert!(optimizer.suggest_indexes().is_empty());

  optimizer.reset_stats();
  assert!(optimizer.slow_queries().is_empty());
  assert!(optimizer.query_stats().is_empty());
}

#[tokio::test]
async fn test_slow_log_is_bounded() {
  let db = FakeDb::new();
  let config = OptimizerConfig {
    slow_query_threshold_ms: 0,
    slow_query_log_size: 2,
    ..OptimizerConfig::default()
  };
  let optimizer = fake_optimizer(&db, config, pool_config(1, 2)).await;
  db.set_delay(Duration::from_millis(2));

  for table in ["a", "b", "c"] {
    let sql = format!("SELECT * FROM {}", table);
    optimizer.execute(&sql, &[], QueryOptions::read().no_cache()).await.unwrap();
  }
  let shapes: Vec<String> = optimizer.slow_queries().into_iter().map(|r| r.query_shape).collect();
  assert_eq!(shapes, vec!["SELECT * FROM b", "SELECT * FROM c"]);
}

#[tokio::test]
async fn test_transactional_batch_rolls_back_on_failure() {
  let db = FakeDb::new();
  db.fail_on("audit");
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 2)).await;

  let statements = vec![
    Statement::new("INSERT INTO messages (body) VALUES ($1)", vec!["a".into()]),
    Statement::new("INSERT INTO audit (event) VALUES ($1)", vec!["sent".into()]),
    Statement::new("INSERT INTO messages (body) VALUES ($1)", vec!["b".into()]),
  ];
  let err = optimizer.execute_batch(&statements, true).await.unwrap_err();

  match err {
    DbError::TransactionFailed { index, source } => {
      assert_eq!(index, 1);
      assert!(matches!(*source, DbError::Execution { .. }));
    }
    other => panic!("unexpected error {:?}", other),
  }
  assert_eq!(
    db.log(),
    vec![
      "BEGIN",
      "INSERT INTO messages (body) VALUES ($1)",
      "INSERT INTO audit (event) VALUES ($1)",
      "ROLLBACK"
    ]
  );
}

#[tokio::test]
async fn test_sqlite_batch_atomicity() {
  let dir = TempDir::new().unwrap();
  let optimizer = sqlite_optimizer(&dir, OptimizerConfig::default()).await;
  let count = "SELECT count(*) AS n FROM users";

  let statements = vec![
    Statement::new("INSERT INTO users (id, name) VALUES ($1, $2)", vec![SqlValue::Int(1), "alice".into()]),
    Statement::new("INSERT INTO users (id, name) VALUES ($1, $2)", vec![SqlValue::Int(1), "dup".into()]),
  ];

  assert!(optimizer.execute_batch(&statements, true).await.is_err());
  let rows = optimizer.execute(count, &[], QueryOptions::read()).await.unwrap();
  assert_eq!(rows.rows[0].get("n").and_then(SqlValue::as_i64), Some(0));

  let results = optimizer.execute_batch(&statements, false).await.unwrap();
  assert!(results[0].is_ok());
  assert!(results[1].is_err());
  // the successful insert dropped the cached count
  let rows = optimizer.execute(count, &[], QueryOptions::read()).await.unwrap();
  assert_eq!(rows.rows[0].get("n").and_then(SqlValue::as_i64), Some(1));

  let ok = vec![
    Statement::new("INSERT INTO users (id, name) VALUES ($1, $2)", vec![SqlValue::Int(2), "bob".into()]),
    Statement::new("UPDATE users SET name = $1 WHERE id = $2", vec!["carol".into(), SqlValue::Int(1)]),
  ];
  let results = optimizer.execute_batch(&ok, true).await.unwrap();
  assert_eq!(results.len(), 2);
  assert!(results.iter().all(|r| matches!(r, Ok(r) if r.rows_affected == 1)));
}

#[tokio::test]
async fn test_fetch_as_decodes_rows() {
  #[derive(Debug, Deserialize, PartialEq)]
  struct User {
    id: i64,
    name: String,
  }

  let dir = TempDir::new().unwrap();
  let optimizer = sqlite_optimizer(&dir, OptimizerConfig::default()).await;
  optimizer
    .execute(
      "INSERT INTO users (id, name) VALUES ($1, $2), ($3, $4)",
      &[SqlValue::Int(1), "alice".into(), SqlValue::Int(2), "bob".into()],
      QueryOptions::write(),
    )
    .await
    .unwrap();

  let users: Vec<User> = optimizer
    .fetch_as("SELECT id, name FROM users ORDER BY id", &[], QueryOptions::read())
    .await
    .unwrap();
  assert_eq!(
    users,
    vec![
      User {
        id: 1,
        name: "alice".into()
      },
      User {
        id: 2,
        name: "bob".into()
      },
    ]
  );

  let one: Vec<User> = optimizer
    .fetch_as("SELECT id, name FROM users WHERE id = $1", &[SqlValue::Int(2)], QueryOptions::read())
    .await
    .unwrap();
  assert_eq!(one.len(), 1);
}

#[tokio::test]
async fn test_existing_indexes_suppress_suggestions() {
  let dir = TempDir::new().unwrap();
  let config = OptimizerConfig {
    slow_query_threshold_ms: 0,
    ..OptimizerConfig::default()
  };
  let optimizer = sqlite_optimizer(&dir, config).await;
  optimizer
    .execute("CREATE INDEX idx_messages_user ON messages (user_id, id)", &[], QueryOptions::write())
    .await
    .unwrap();
  assert_eq!(optimizer.load_existing_indexes().await.unwrap(), 1);

  optimizer.reset_stats();
  for sql in [
    "SELECT * FROM messages WHERE user_id = $1 ORDER BY id",
    "SELECT * FROM messages WHERE user_id = $1 ORDER BY body",
  ] {
    optimizer.execute(sql, &[SqlValue::Int(1)], QueryOptions::read()).await.unwrap();
  }

  assert_eq!(
    optimizer.suggest_indexes(),
    vec!["CREATE INDEX IF NOT EXISTS idx_messages_user_id_body ON messages (user_id, body)"]
  );
}

#[tokio::test]
async fn test_maintenance_on_sqlite() {
  let dir = TempDir::new().unwrap();
  let optimizer = sqlite_optimizer(&dir, OptimizerConfig::default()).await;

  let report = optimizer
    .maintenance(&["users", "messages", "users; DROP TABLE users"])
    .await
    .unwrap();
  assert_eq!(report.succeeded, vec!["users", "messages"]);
  assert_eq!(report.failed.len(), 1);
  assert_eq!(report.failed[0].target, "users; DROP TABLE users");

  // the table survived
  optimizer
    .execute("SELECT count(*) FROM users", &[], QueryOptions::read().no_cache())
    .await
    .unwrap();
}

#[tokio::test]
async fn test_maintenance_on_postgres_vacuums_each_table() {
  let db = FakeDb::new();
  db.fail_on("conversations");
  let optimizer = fake_optimizer(&db, OptimizerConfig::default(), pool_config(1, 1)).await;

  let report = optimizer
    .maintenance(&["messages", "conversations", "users"])
    .await
    .unwrap();
  assert_eq!(report.succeeded, vec!["messages", "users"]);
  assert_eq!(report.failed[0].target, "conversations");
  assert_eq!(
    db.log(),
    vec![
      "VACUUM (ANALYZE) messages",
      "VACUUM (ANALYZE) conversations",
      "VACUUM (ANALYZE) users"
    ]
  );
}
