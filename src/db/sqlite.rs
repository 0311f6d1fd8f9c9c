use async_trait::async_trait;
use rusqlite::types::{Value, ValueRef};
use rusqlite::InterruptHandle;

use super::backend::{Connection, Connector, SessionSettings, SqlDialect};
use super::error::DbError;
use super::value::{QueryResult, Row, SqlValue};

pub struct SqliteConnector {
  path: String,
}

impl SqliteConnector {
  pub fn new(path: impl Into<String>) -> Self {
    Self { path: path.into() }
  }

  /// Accepts `sqlite://path`, `sqlite:path` or a bare file path
  pub fn from_dsn(dsn: &str) -> Self {
    let path = dsn
      .strip_prefix("sqlite://")
      .or_else(|| dsn.strip_prefix("sqlite:"))
      .unwrap_or(dsn);
    Self::new(path)
  }

  pub fn path(&self) -> &str {
    &self.path
  }
}

#[async_trait]
impl Connector for SqliteConnector {
  async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
    let conn = if self.path == ":memory:" {
      tokio_rusqlite::Connection::open_in_memory().await
    } else {
      tokio_rusqlite::Connection::open(&self.path).await
    }
    .map_err(|e| DbError::Connect(format!("sqlite {}: {}", self.path, e)))?;
    let interrupt = conn
      .call(|conn| Ok(conn.get_interrupt_handle()))
      .await
      .map_err(|e| DbError::Connect(format!("sqlite {}: {}", self.path, e)))?;

    Ok(Box::new(SqliteConnection {
      conn,
      interrupt,
      in_transaction: false,
    }))
  }

  fn dialect(&self) -> SqlDialect {
    SqlDialect::Sqlite
  }

  fn describe(&self) -> String {
    format!("sqlite://{}", self.path)
  }
}

pub struct SqliteConnection {
  conn: tokio_rusqlite::Connection,
  interrupt: InterruptHandle,
  in_transaction: bool,
}

/// Stops the statement on the worker thread when the awaiting future is
/// dropped before it finishes, so a timed-out or cancelled query does not
/// keep the connection busy
struct InterruptOnDrop<'a> {
  handle: &'a InterruptHandle,
  armed: bool,
}

impl<'a> InterruptOnDrop<'a> {
  fn new(handle: &'a InterruptHandle) -> Self {
    Self { handle, armed: true }
  }

  fn disarm(mut self) {
    self.armed = false;
  }
}

impl Drop for InterruptOnDrop<'_> {
  fn drop(&mut self) {
    if self.armed {
      tracing::debug!("interrupting abandoned sqlite statement");
      self.handle.interrupt();
    }
  }
}

impl SqliteConnection {
  async fn batch(&self, sql: &str) -> Result<(), DbError> {
    let owned = sql.to_string();
    self
      .conn
      .call(move |conn| conn.execute_batch(&owned).map_err(|e| e.into()))
      .await
      .map_err(|e| DbError::execution(sql, e))
  }
}

/// `$1` placeholders become SQLite's numbered `?1`. Quoted literals and
/// identifiers are copied untouched; a doubled quote toggles twice, so
/// `''` escapes need no special case.
pub fn rewrite_placeholders(sql: &str) -> String {
  let mut out = String::with_capacity(sql.len());
  let mut quote: Option<char> = None;
  let mut chars = sql.chars().peekable();
  while let Some(c) = chars.next() {
    match quote {
      Some(q) if c == q => quote = None,
      Some(_) => {}
      None if c == '\'' || c == '"' => quote = Some(c),
      None if c == '$' && chars.peek().is_some_and(|n| n.is_ascii_digit()) => {
        out.push('?');
        continue;
      }
      None => {}
    }
    out.push(c);
  }
  out
}

fn to_sqlite(value: &SqlValue) -> Value {
  match value {
    SqlValue::Null => Value::Null,
    SqlValue::Bool(b) => Value::Integer(*b as i64),
    SqlValue::Int(i) => Value::Integer(*i),
    SqlValue::Float(f) => Value::Real(*f),
    SqlValue::Text(s) => Value::Text(s.clone()),
    SqlValue::Bytes(b) => Value::Blob(b.clone()),
    SqlValue::Json(v) => Value::Text(v.to_string()),
  }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
  match value {
    ValueRef::Null => SqlValue::Null,
    ValueRef::Integer(i) => SqlValue::Int(i),
    ValueRef::Real(f) => SqlValue::Float(f),
    ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
    ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
  }
}

#[async_trait]
impl Connection for SqliteConnection {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Sqlite
  }

  async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
    let rewritten = rewrite_placeholders(sql);
    let values: Vec<Value> = params.iter().map(to_sqlite).collect();

    let guard = InterruptOnDrop::new(&self.interrupt);
    let result = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&rewritten)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        if columns.is_empty() {
          let changed = stmt.execute(rusqlite::params_from_iter(values.iter()))?;
          return Ok(QueryResult::affected(changed as u64));
        }

        let mut rows = Vec::new();
        let mut cursor = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        while let Some(row) = cursor.next()? {
          let mut cells = Vec::with_capacity(columns.len());
          for idx in 0..columns.len() {
            cells.push(from_sqlite(row.get_ref(idx)?));
          }
          rows.push(Row::new(columns.clone(), cells));
        }

        Ok(QueryResult {
          columns,
          rows_affected: rows.len() as u64,
          rows,
        })
      })
      .await;
    guard.disarm();
    result.map_err(|e| DbError::execution(sql, e))
  }

  async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
    self.batch(sql).await
  }

  async fn prepare(&mut self, sql: &str) -> Result<(), DbError> {
    let rewritten = rewrite_placeholders(sql);
    self
      .conn
      .call(move |conn| {
        conn.prepare_cached(&rewritten)?;
        Ok(())
      })
      .await
      .map_err(|e| DbError::execution(sql, e))
  }

  async fn configure_session(&mut self, settings: &SessionSettings) -> Result<(), DbError> {
    let busy_ms = settings.busy_timeout.as_millis() as u64;
    self
      .conn
      .call(move |conn| {
        // journal_mode reports the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
        Ok(())
      })
      .await
      .map_err(|e| DbError::execution("PRAGMA", e))
  }

  async fn begin(&mut self) -> Result<(), DbError> {
    self.batch("BEGIN").await?;
    self.in_transaction = true;
    Ok(())
  }

  async fn commit(&mut self) -> Result<(), DbError> {
    let result = self.batch("COMMIT").await;
    self.in_transaction = false;
    result
  }

  async fn rollback(&mut self) -> Result<(), DbError> {
    let result = self.batch("ROLLBACK").await;
    self.in_transaction = false;
    result
  }

  fn in_transaction(&self) -> bool {
    self.in_transaction
  }

  async fn is_valid(&mut self) -> bool {
    self
      .conn
      .call(|conn| conn.query_row("SELECT 1", [], |_| Ok(())).map_err(|e| e.into()))
      .await
      .is_ok()
  }
}
