//! Data access layer for chat application servers
//!
//! - [`cache`]: two-tier response cache (in-process LRU plus Redis)
//! - [`db`]: read/write connection pools over PostgreSQL and SQLite
//! - [`query`]: cached, timed query execution with index advice
//! - [`service`]: the assembled [`DataLayer`]

pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod query;
pub mod service;

pub use config::Config;
pub use service::DataLayer;
