mod backend;
mod error;
pub mod pool;
mod postgres;
pub mod sanitize;
mod sqlite;
mod value;

pub use backend::{mask_password, Connection, Connector, SessionSettings, SqlDialect};
pub use error::DbError;
pub use pool::{
  connector_for, ConnectionPool, ConnectionPoolManager, PoolConfig, PoolIntent, PoolManagerStats,
  PoolState, PoolStats, PooledConnection,
};
pub use postgres::{PostgresConnection, PostgresConnector};
pub use sanitize::{validate_identifier, SqlSanitizeError};
pub use sqlite::{rewrite_placeholders, SqliteConnection, SqliteConnector};
pub use value::{QueryResult, Row, SqlValue};
