//! Query execution on top of the cache and the connection pools
//!
//! - Read-through caching of query results, scoped per table
//! - Light rewriting of single-row lookups
//! - Per-shape latency records and a bounded slow query log
//! - Batch and transactional execution
//! - Index suggestions and table maintenance

mod advisor;
mod optimizer;
pub mod rewrite;
mod stats;

pub use advisor::IndexSuggestion;
pub use optimizer::{
  KnownIndex, MaintenanceFailure, MaintenanceReport, OptimizerConfig, QueryOptimizer, QueryOptions, Statement,
};
pub use stats::{params_fingerprint, QueryRecord, SlowQueryRecord};
