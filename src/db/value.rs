//! Backend-neutral SQL values and rows

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::DbError;

/// A single SQL parameter or result cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlValue {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Text(String),
  Bytes(Vec<u8>),
  Json(serde_json::Value),
}

impl SqlValue {
  pub fn is_null(&self) -> bool {
    matches!(self, SqlValue::Null)
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      SqlValue::Int(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      SqlValue::Text(s) => Some(s),
      _ => None,
    }
  }

  /// Natural JSON form, used for typed row decoding
  pub fn to_json(&self) -> serde_json::Value {
    match self {
      SqlValue::Null => serde_json::Value::Null,
      SqlValue::Bool(b) => serde_json::Value::Bool(*b),
      SqlValue::Int(i) => serde_json::Value::from(*i),
      SqlValue::Float(f) => serde_json::Number::from_f64(*f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null),
      SqlValue::Text(s) => serde_json::Value::String(s.clone()),
      SqlValue::Bytes(b) => serde_json::Value::from(b.clone()),
      SqlValue::Json(v) => v.clone(),
    }
  }
}

impl From<bool> for SqlValue {
  fn from(v: bool) -> Self {
    SqlValue::Bool(v)
  }
}

impl From<i32> for SqlValue {
  fn from(v: i32) -> Self {
    SqlValue::Int(v as i64)
  }
}

impl From<i64> for SqlValue {
  fn from(v: i64) -> Self {
    SqlValue::Int(v)
  }
}

impl From<f64> for SqlValue {
  fn from(v: f64) -> Self {
    SqlValue::Float(v)
  }
}

impl From<&str> for SqlValue {
  fn from(v: &str) -> Self {
    SqlValue::Text(v.to_string())
  }
}

impl From<String> for SqlValue {
  fn from(v: String) -> Self {
    SqlValue::Text(v)
  }
}

impl From<Vec<u8>> for SqlValue {
  fn from(v: Vec<u8>) -> Self {
    SqlValue::Bytes(v)
  }
}

impl From<serde_json::Value> for SqlValue {
  fn from(v: serde_json::Value) -> Self {
    SqlValue::Json(v)
  }
}

impl From<uuid::Uuid> for SqlValue {
  fn from(v: uuid::Uuid) -> Self {
    SqlValue::Text(v.to_string())
  }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(SqlValue::Null)
  }
}

/// One result row; cells are positional and paired with column names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
  pub columns: Vec<String>,
  pub values: Vec<SqlValue>,
}

impl Row {
  pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
    Self { columns, values }
  }

  pub fn get(&self, column: &str) -> Option<&SqlValue> {
    self
      .columns
      .iter()
      .position(|c| c == column)
      .and_then(|i| self.values.get(i))
  }

  pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
    self.values.get(index)
  }

  /// Decode the row into `T` by column name
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DbError> {
    let object: serde_json::Map<String, serde_json::Value> = self
      .columns
      .iter()
      .cloned()
      .zip(self.values.iter().map(SqlValue::to_json))
      .collect();
    serde_json::from_value(serde_json::Value::Object(object)).map_err(|e| DbError::Decode(e.to_string()))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
  pub columns: Vec<String>,
  pub rows: Vec<Row>,
  /// Rows changed by a write, or rows returned by a read
  pub rows_affected: u64,
}

impl QueryResult {
  pub fn affected(rows_affected: u64) -> Self {
    Self {
      rows_affected,
      ..Default::default()
    }
  }

  pub fn first(&self) -> Option<&Row> {
    self.rows.first()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, DbError> {
    self.rows.iter().map(Row::decode).collect()
  }

  /// JSON has no NaN or infinity, so such cells would not survive a cache
  /// round trip
  pub fn has_non_finite(&self) -> bool {
    self
      .rows
      .iter()
      .flat_map(|row| row.values.iter())
      .any(|value| matches!(value, SqlValue::Float(f) if !f.is_finite()))
  }
}
