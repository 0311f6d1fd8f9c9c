//! Cache counters and the low hit rate detector

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
  /// (memory_hits + distributed_hits) / total_requests
  pub hit_rate: f64,
  pub memory_hit_rate: f64,
  pub total_requests: u64,
  pub memory_hits: u64,
  pub distributed_hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub expirations: u64,
  pub size_bytes: usize,
  pub items: usize,
  pub max_items: usize,
  pub distributed_errors: u64,
  pub distributed_available: bool,
}

impl CacheStats {
  pub fn hits(&self) -> u64 {
    self.memory_hits + self.distributed_hits
  }
}

pub(crate) fn ratio(part: u64, total: u64) -> f64 {
  if total == 0 {
    0.0
  } else {
    part as f64 / total as f64
  }
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
  pub memory_hits: AtomicU64,
  pub distributed_hits: AtomicU64,
  pub misses: AtomicU64,
  pub distributed_errors: AtomicU64,
}

impl CacheCounters {
  pub fn memory_hit(&self) {
    self.memory_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn distributed_hit(&self) {
    self.distributed_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn distributed_error(&self) {
    self.distributed_errors.fetch_add(1, Ordering::Relaxed);
  }
}

/// Window summary published with a low hit rate alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowHitRate {
  pub hit_rate: f64,
  pub threshold: f64,
  pub window_requests: u64,
  pub consecutive_windows: u32,
}

/// Tracks per-window hit rates between reports.
///
/// Windows with fewer than `min_requests` requests neither raise nor reset
/// the streak. An alert fires each time the streak reaches a multiple of
/// `windows`, so a persistently cold cache is reported periodically instead
/// of on every tick.
#[derive(Debug)]
pub(crate) struct HitRateWindow {
  last_requests: u64,
  last_hits: u64,
  streak: u32,
}

impl HitRateWindow {
  pub fn new() -> Self {
    Self {
      last_requests: 0,
      last_hits: 0,
      streak: 0,
    }
  }

  pub fn observe(
    &mut self,
    stats: &CacheStats,
    threshold: f64,
    min_requests: u64,
    windows: u32,
  ) -> Option<LowHitRate> {
    let requests = stats.total_requests.saturating_sub(self.last_requests);
    let hits = stats.hits().saturating_sub(self.last_hits);
    self.last_requests = stats.total_requests;
    self.last_hits = stats.hits();

    if requests < min_requests.max(1) {
      return None;
    }

    let hit_rate = ratio(hits, requests);
    if hit_rate >= threshold {
      self.streak = 0;
      return None;
    }

    self.streak += 1;
    let windows = windows.max(1);
    if self.streak % windows == 0 {
      Some(LowHitRate {
        hit_rate,
        threshold,
        window_requests: requests,
        consecutive_windows: self.streak,
      })
    } else {
      None
    }
  }
}
