use thiserror::Error;

use super::pool::{PoolIntent, PoolState};
use super::sanitize::SqlSanitizeError;

/// Longest statement text carried inside an error
const MAX_SHAPE_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum DbError {
  #[error("no {intent} connection available after {waited_ms}ms")]
  PoolExhausted { intent: PoolIntent, waited_ms: u64 },

  #[error("connection pool is closed")]
  PoolClosed,

  #[error("connection pool is not ready (state: {0})")]
  PoolNotReady(PoolState),

  #[error("query exceeded {timeout_ms}ms: {shape}")]
  QueryTimeout { shape: String, timeout_ms: u64 },

  #[error("query failed: {message} ({shape})")]
  Execution { shape: String, message: String },

  #[error("connection failed: {0}")]
  Connect(String),

  #[error("invalid database configuration: {0}")]
  Config(String),

  #[error("invalid identifier: {0}")]
  InvalidIdentifier(#[from] SqlSanitizeError),

  #[error("row decode failed: {0}")]
  Decode(String),

  #[error("transaction rolled back at statement {index}: {source}")]
  TransactionFailed {
    index: usize,
    #[source]
    source: Box<DbError>,
  },
}

impl DbError {
  pub fn execution(sql: &str, err: impl std::fmt::Display) -> Self {
    DbError::Execution {
      shape: truncate_shape(sql),
      message: err.to_string(),
    }
  }

  pub fn timeout(sql: &str, timeout_ms: u64) -> Self {
    DbError::QueryTimeout {
      shape: truncate_shape(sql),
      timeout_ms,
    }
  }

  /// Whether retrying the same call later could succeed
  pub fn is_retryable(&self) -> bool {
    match self {
      DbError::PoolExhausted { .. } | DbError::QueryTimeout { .. } | DbError::Connect(_) => true,
      DbError::TransactionFailed { source, .. } => source.is_retryable(),
      _ => false,
    }
  }
}

fn truncate_shape(sql: &str) -> String {
  if sql.len() <= MAX_SHAPE_LEN {
    return sql.to_string();
  }
  let mut end = MAX_SHAPE_LEN;
  while !sql.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}...", &sql[..end])
}
