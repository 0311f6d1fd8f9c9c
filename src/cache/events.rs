//! Cache events published to subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stats::{CacheStats, LowHitRate};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEventKind {
  /// Periodic aggregate metrics
  Report(CacheStats),
  LowHitRate(LowHitRate),
  /// The distributed tier failed and is being skipped
  DistributedUnavailable { error: String },
  DistributedRecovered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
  pub kind: CacheEventKind,
  pub at: DateTime<Utc>,
}

impl CacheEvent {
  pub fn new(kind: CacheEventKind) -> Self {
    Self { kind, at: Utc::now() }
  }
}
