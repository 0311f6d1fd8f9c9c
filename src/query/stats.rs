use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

use crate::db::SqlValue;

/// Aggregated timings for one statement shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
  pub query_shape: String,
  /// Fingerprint of the most recent parameters
  pub params_fingerprint: String,
  pub count: u64,
  pub total_time_ms: f64,
  pub avg_time_ms: f64,
  pub max_time_ms: f64,
  pub min_time_ms: f64,
  pub cache_hits: u64,
  pub cache_misses: u64,
}

impl QueryRecord {
  fn new(query_shape: &str) -> Self {
    Self {
      query_shape: query_shape.to_string(),
      params_fingerprint: String::new(),
      count: 0,
      total_time_ms: 0.0,
      avg_time_ms: 0.0,
      max_time_ms: 0.0,
      min_time_ms: 0.0,
      cache_hits: 0,
      cache_misses: 0,
    }
  }

  fn observe(&mut self, elapsed_ms: f64) {
    if self.count == 0 || elapsed_ms < self.min_time_ms {
      self.min_time_ms = elapsed_ms;
    }
    if elapsed_ms > self.max_time_ms {
      self.max_time_ms = elapsed_ms;
    }
    self.count += 1;
    self.total_time_ms += elapsed_ms;
    self.avg_time_ms = self.total_time_ms / self.count as f64;
  }
}

/// A statement that ran past the slow query threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryRecord {
  pub query_shape: String,
  pub params: Vec<SqlValue>,
  pub execution_time_ms: f64,
  pub timestamp: DateTime<Utc>,
}

/// Short stable digest of a parameter list
pub fn params_fingerprint(params: &[SqlValue]) -> String {
  let encoded = serde_json::to_vec(params).unwrap_or_default();
  let digest = Sha256::digest(&encoded);
  hex::encode(&digest[..8])
}

/// Per-shape records plus a bounded slow query log
pub(crate) struct QueryStats {
  records: Mutex<HashMap<String, QueryRecord>>,
  slow: Mutex<VecDeque<SlowQueryRecord>>,
  slow_capacity: usize,
}

impl QueryStats {
  pub(crate) fn new(slow_capacity: usize) -> Self {
    Self {
      records: Mutex::new(HashMap::new()),
      slow: Mutex::new(VecDeque::with_capacity(slow_capacity.min(1024))),
      slow_capacity,
    }
  }

  /// Record one execution that reached the database
  pub(crate) fn record_execution(&self, shape: &str, params: &[SqlValue], elapsed_ms: f64, cacheable: bool) {
    let fingerprint = params_fingerprint(params);
    let mut records = self.records.lock();
    let record = records
      .entry(shape.to_string())
      .or_insert_with(|| QueryRecord::new(shape));
    record.observe(elapsed_ms);
    record.params_fingerprint = fingerprint;
    if cacheable {
      record.cache_misses += 1;
    }
  }

  pub(crate) fn record_cache_hit(&self, shape: &str, params: &[SqlValue]) {
    let fingerprint = params_fingerprint(params);
    let mut records = self.records.lock();
    let record = records
      .entry(shape.to_string())
      .or_insert_with(|| QueryRecord::new(shape));
    record.cache_hits += 1;
    record.params_fingerprint = fingerprint;
  }

  /// Append to the slow log, evicting the oldest record when full
  pub(crate) fn record_slow(&self, record: SlowQueryRecord) {
    if self.slow_capacity == 0 {
      return;
    }
    let mut slow = self.slow.lock();
    while slow.len() >= self.slow_capacity {
      slow.pop_front();
    }
    slow.push_back(record);
  }

  /// Records sorted by total time, most expensive first
  pub(crate) fn records(&self) -> Vec<QueryRecord> {
    let mut records: Vec<QueryRecord> = self.records.lock().values().cloned().collect();
    records.sort_by(|a, b| b.total_time_ms.total_cmp(&a.total_time_ms));
    records
  }

  /// Slow log, oldest first
  pub(crate) fn slow_queries(&self) -> Vec<SlowQueryRecord> {
    self.slow.lock().iter().cloned().collect()
  }

  pub(crate) fn reset(&self) {
    self.records.lock().clear();
    self.slow.lock().clear();
  }
}
