use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Statement};

use super::backend::{mask_password, Connection, Connector, SessionSettings, SqlDialect};
use super::error::DbError;
use super::value::{QueryResult, Row, SqlValue};

/// Prepared statements kept per connection
const MAX_CACHED_STATEMENTS: usize = 256;

pub struct PostgresConnector {
  config: tokio_postgres::Config,
  display_url: String,
}

impl PostgresConnector {
  pub fn new(url: &str) -> Result<Self, DbError> {
    let config = url
      .parse::<tokio_postgres::Config>()
      .map_err(|e| DbError::Config(format!("invalid postgres url: {}", e)))?;
    Ok(Self {
      config,
      display_url: mask_password(url),
    })
  }
}

#[async_trait]
impl Connector for PostgresConnector {
  async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
    let (client, connection) = self
      .config
      .connect(NoTls)
      .await
      .map_err(|e| DbError::Connect(format!("{}: {}", self.display_url, e)))?;

    tokio::spawn(async move {
      if let Err(e) = connection.await {
        tracing::warn!("PostgreSQL connection closed with error: {}", e);
      }
    });

    Ok(Box::new(PostgresConnection {
      client,
      statements: HashMap::new(),
      in_transaction: false,
    }))
  }

  fn dialect(&self) -> SqlDialect {
    SqlDialect::Postgres
  }

  fn describe(&self) -> String {
    self.display_url.clone()
  }
}

pub struct PostgresConnection {
  client: Client,
  statements: HashMap<String, Statement>,
  in_transaction: bool,
}

impl PostgresConnection {
  async fn statement(&mut self, sql: &str) -> Result<Statement, DbError> {
    if let Some(stmt) = self.statements.get(sql) {
      return Ok(stmt.clone());
    }
    let stmt = self
      .client
      .prepare(sql)
      .await
      .map_err(|e| DbError::execution(sql, e))?;
    if self.statements.len() < MAX_CACHED_STATEMENTS {
      self.statements.insert(sql.to_string(), stmt.clone());
    }
    Ok(stmt)
  }

  async fn simple(&mut self, sql: &str) -> Result<(), DbError> {
    self
      .client
      .batch_execute(sql)
      .await
      .map_err(|e| DbError::execution(sql, e))
  }
}

#[async_trait]
impl Connection for PostgresConnection {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Postgres
  }

  async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
    let stmt = self.statement(sql).await?;
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

    if stmt.columns().is_empty() {
      let rows_affected = self
        .client
        .execute(&stmt, &refs)
        .await
        .map_err(|e| DbError::execution(sql, e))?;
      return Ok(QueryResult::affected(rows_affected));
    }

    let pg_rows = self
      .client
      .query(&stmt, &refs)
      .await
      .map_err(|e| DbError::execution(sql, e))?;

    let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
    let mut rows = Vec::with_capacity(pg_rows.len());
    for pg_row in &pg_rows {
      let mut values = Vec::with_capacity(columns.len());
      for (idx, column) in pg_row.columns().iter().enumerate() {
        values.push(decode_cell(pg_row, idx, column.type_()).map_err(|e| DbError::Decode(e.to_string()))?);
      }
      rows.push(Row::new(columns.clone(), values));
    }

    Ok(QueryResult {
      columns,
      rows_affected: rows.len() as u64,
      rows,
    })
  }

  async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
    self.simple(sql).await
  }

  async fn prepare(&mut self, sql: &str) -> Result<(), DbError> {
    self.statement(sql).await.map(|_| ())
  }

  async fn configure_session(&mut self, settings: &SessionSettings) -> Result<(), DbError> {
    let sql = format!(
      "SET statement_timeout = {}; SET idle_in_transaction_session_timeout = {}",
      settings.statement_timeout.as_millis(),
      settings.idle_in_transaction_timeout.as_millis()
    );
    self.simple(&sql).await
  }

  async fn begin(&mut self) -> Result<(), DbError> {
    self.simple("BEGIN").await?;
    self.in_transaction = true;
    Ok(())
  }

  async fn commit(&mut self) -> Result<(), DbError> {
    let result = self.simple("COMMIT").await;
    self.in_transaction = false;
    result
  }

  async fn rollback(&mut self) -> Result<(), DbError> {
    let result = self.simple("ROLLBACK").await;
    self.in_transaction = false;
    result
  }

  fn in_transaction(&self) -> bool {
    self.in_transaction
  }

  async fn is_valid(&mut self) -> bool {
    !self.client.is_closed()
  }
}

fn decode_cell(
  row: &tokio_postgres::Row,
  idx: usize,
  ty: &Type,
) -> Result<SqlValue, tokio_postgres::Error> {
  let value = if *ty == Type::BOOL {
    row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool)
  } else if *ty == Type::INT2 {
    row.try_get::<_, Option<i16>>(idx)?.map(|v| SqlValue::Int(v as i64))
  } else if *ty == Type::INT4 {
    row.try_get::<_, Option<i32>>(idx)?.map(|v| SqlValue::Int(v as i64))
  } else if *ty == Type::INT8 {
    row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
  } else if *ty == Type::OID {
    row.try_get::<_, Option<u32>>(idx)?.map(|v| SqlValue::Int(v as i64))
  } else if *ty == Type::FLOAT4 {
    row.try_get::<_, Option<f32>>(idx)?.map(|v| SqlValue::Float(v as f64))
  } else if *ty == Type::FLOAT8 {
    row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Float)
  } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
    row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
  } else if *ty == Type::BYTEA {
    row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes)
  } else if *ty == Type::JSON || *ty == Type::JSONB {
    row
      .try_get::<_, Option<serde_json::Value>>(idx)?
      .map(SqlValue::Json)
  } else if *ty == Type::UUID {
    row
      .try_get::<_, Option<uuid::Uuid>>(idx)?
      .map(|v| SqlValue::Text(v.to_string()))
  } else if *ty == Type::TIMESTAMPTZ {
    row
      .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
      .map(|v| SqlValue::Text(v.to_rfc3339()))
  } else if *ty == Type::TIMESTAMP {
    row
      .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
      .map(|v| SqlValue::Text(v.to_string()))
  } else if *ty == Type::DATE {
    row
      .try_get::<_, Option<chrono::NaiveDate>>(idx)?
      .map(|v| SqlValue::Text(v.to_string()))
  } else {
    tracing::trace!(column = idx, ty = %ty, "unsupported column type, returning NULL");
    None
  };
  Ok(value.unwrap_or(SqlValue::Null))
}

impl ToSql for SqlValue {
  fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    match self {
      SqlValue::Null => Ok(IsNull::Yes),
      SqlValue::Bool(b) => b.to_sql(ty, out),
      SqlValue::Int(i) => {
        if *ty == Type::INT2 {
          i16::try_from(*i)?.to_sql(ty, out)
        } else if *ty == Type::INT4 {
          i32::try_from(*i)?.to_sql(ty, out)
        } else if *ty == Type::OID {
          u32::try_from(*i)?.to_sql(ty, out)
        } else if *ty == Type::FLOAT4 {
          (*i as f32).to_sql(ty, out)
        } else if *ty == Type::FLOAT8 {
          (*i as f64).to_sql(ty, out)
        } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
          i.to_string().to_sql(ty, out)
        } else {
          i.to_sql(ty, out)
        }
      }
      SqlValue::Float(f) => {
        if *ty == Type::FLOAT4 {
          (*f as f32).to_sql(ty, out)
        } else {
          f.to_sql(ty, out)
        }
      }
      SqlValue::Text(s) => {
        if *ty == Type::UUID {
          uuid::Uuid::parse_str(s)?.to_sql(ty, out)
        } else if *ty == Type::TIMESTAMPTZ {
          chrono::DateTime::parse_from_rfc3339(s)?
            .with_timezone(&chrono::Utc)
            .to_sql(ty, out)
        } else {
          s.as_str().to_sql(ty, out)
        }
      }
      SqlValue::Bytes(b) => b.as_slice().to_sql(ty, out),
      SqlValue::Json(v) => {
        if *ty == Type::TEXT || *ty == Type::VARCHAR {
          v.to_string().to_sql(ty, out)
        } else {
          v.to_sql(ty, out)
        }
      }
    }
  }

  fn accepts(_ty: &Type) -> bool {
    true
  }

  to_sql_checked!();
}
