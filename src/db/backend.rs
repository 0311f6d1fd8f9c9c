use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::DbError;
use super::value::{QueryResult, SqlValue};

/// SQL dialect spoken by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
  Postgres,
  Sqlite,
}

impl std::fmt::Display for SqlDialect {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SqlDialect::Postgres => write!(f, "postgres"),
      SqlDialect::Sqlite => write!(f, "sqlite"),
    }
  }
}

/// Per-connection settings applied right after connecting
#[derive(Debug, Clone)]
pub struct SessionSettings {
  /// Server-side limit for a single statement
  pub statement_timeout: Duration,
  /// How long a session may sit idle inside a transaction
  pub idle_in_transaction_timeout: Duration,
  /// SQLite lock wait
  pub busy_timeout: Duration,
}

/// A single physical database connection
#[async_trait]
pub trait Connection: Send + Sync {
  fn dialect(&self) -> SqlDialect;

  /// Run one statement. Statements that produce rows return them; others
  /// report `rows_affected`. Placeholders are `$1..$n` on every backend.
  async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError>;

  async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
    Ok(self.query(sql, params).await?.rows_affected)
  }

  /// Run several `;`-separated statements without parameters
  async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError>;

  /// Prepare and remember a statement so later executions skip planning
  async fn prepare(&mut self, sql: &str) -> Result<(), DbError>;

  async fn configure_session(&mut self, settings: &SessionSettings) -> Result<(), DbError>;

  async fn begin(&mut self) -> Result<(), DbError>;
  async fn commit(&mut self) -> Result<(), DbError>;
  async fn rollback(&mut self) -> Result<(), DbError>;

  /// A transaction opened through `begin` is still open
  fn in_transaction(&self) -> bool;

  /// Cheap liveness check used before handing the connection out again
  async fn is_valid(&mut self) -> bool;
}

/// Opens new physical connections for a pool
#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self) -> Result<Box<dyn Connection>, DbError>;

  fn dialect(&self) -> SqlDialect;

  /// Target description safe for logs
  fn describe(&self) -> String;
}

/// Hide the password part of a connection URL
pub fn mask_password(url: &str) -> String {
  if let Some(at_pos) = url.rfind('@') {
    let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
    if let Some(colon_pos) = url[..at_pos].rfind(':') {
      if colon_pos > scheme_end {
        return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
      }
    }
  }
  url.to_string()
}
