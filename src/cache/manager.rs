//! Tiered cache front end

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::codec::{Codec, Envelope};
use super::config::CacheConfig;
use super::distributed::DistributedStore;
use super::entry::{effective_ttl, CacheEntry};
use super::error::CacheError;
use super::events::{CacheEvent, CacheEventKind};
use super::key::{encode_segment, CacheKey};
use super::memory::{escape_glob, glob_to_regex, MemoryTier};
use super::stats::{ratio, CacheCounters, CacheStats, HitRateWindow};

/// Upper bound on distributed invalidations waiting for the store to come
/// back. Past it they collapse into one wipe of the whole key prefix.
const MAX_PENDING_INVALIDATIONS: usize = 1024;

/// What to drop from the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
  /// Every key of exactly this scope. `user:1` leaves `user:1:settings`
  /// alone; use a pattern such as `user:1:*` for nested scopes.
  Scope(String),
  /// Glob over scopes (`*`, `?`, `[...]`, backslash escapes)
  Pattern(String),
}

impl Invalidation {
  pub fn scope(scope: impl Into<String>) -> Self {
    Invalidation::Scope(scope.into())
  }

  pub fn pattern(pattern: impl Into<String>) -> Self {
    Invalidation::Pattern(pattern.into())
  }

  fn to_glob(&self, prefix: &str) -> String {
    // encoded scopes never contain a raw `:`, so the trailing `:*` only
    // spans the id
    let body = match self {
      Invalidation::Scope(scope) => format!("{}:*", escape_glob(&encode_segment(scope))),
      Invalidation::Pattern(pattern) => format!("{}:*", encode_segment(pattern)),
    };
    if prefix.is_empty() {
      body
    } else {
      format!("{}:{}", escape_glob(prefix), body)
    }
  }
}

struct BackgroundTasks {
  token: CancellationToken,
  handles: Vec<JoinHandle<()>>,
}

/// Two-tier cache: a bounded in-process LRU in front of an optional
/// distributed store.
///
/// Reads go to memory first and fall back to the distributed tier, promoting
/// hits. Writes go to both tiers. The distributed tier is strictly best
/// effort: its failures are logged, counted and turned into misses, and after
/// a failure reads and writes skip it for `distributed_retry_secs`.
///
/// Deletes and invalidations are always attempted on the distributed tier.
/// Any that fail, and any write that could not reach it, are remembered and
/// replayed before the tier is read or written again.
pub struct CacheManager {
  config: CacheConfig,
  memory: MemoryTier,
  distributed: Option<Arc<dyn DistributedStore>>,
  codec: Codec,
  counters: CacheCounters,
  /// Distributed tier is skipped until this instant
  distributed_down_until: Mutex<Option<Instant>>,
  /// Globs still to be deleted from the distributed tier
  pending: tokio::sync::Mutex<BTreeSet<String>>,
  window: Mutex<HitRateWindow>,
  events: broadcast::Sender<CacheEvent>,
  tasks: Mutex<Option<BackgroundTasks>>,
}

impl CacheManager {
  /// Memory-only cache
  pub fn new(config: CacheConfig) -> Self {
    Self::build(config, None)
  }

  pub fn with_distributed(config: CacheConfig, store: Arc<dyn DistributedStore>) -> Self {
    Self::build(config, Some(store))
  }

  fn build(config: CacheConfig, distributed: Option<Arc<dyn DistributedStore>>) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      memory: MemoryTier::new(config.max_memory_items),
      codec: Codec::new(config.compression_threshold_bytes),
      distributed,
      counters: CacheCounters::default(),
      distributed_down_until: Mutex::new(None),
      pending: tokio::sync::Mutex::new(BTreeSet::new()),
      window: Mutex::new(HitRateWindow::new()),
      events,
      tasks: Mutex::new(None),
      config,
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  fn emit(&self, kind: CacheEventKind) {
    let _ = self.events.send(CacheEvent::new(kind));
  }

  fn storage_key(&self, key: &CacheKey) -> String {
    key.to_storage_key(&self.config.key_prefix)
  }

  // -- distributed tier plumbing --

  /// The distributed store, unless absent or cooling down after a failure
  fn distributed(&self) -> Option<Arc<dyn DistributedStore>> {
    let store = self.distributed.as_ref()?;
    let down_until = *self.distributed_down_until.lock();
    match down_until {
      Some(until) if Instant::now() < until => None,
      _ => Some(store.clone()),
    }
  }

  fn distributed_failed(&self, op: &str, error: &str) {
    self.counters.distributed_error();
    let until = Instant::now() + self.config.distributed_retry();
    let was_up = self.distributed_down_until.lock().replace(until).is_none();
    if was_up {
      tracing::warn!(
        op,
        retry_secs = self.config.distributed_retry_secs,
        "distributed cache unavailable, continuing memory-only: {}",
        error
      );
      self.emit(CacheEventKind::DistributedUnavailable {
        error: error.to_string(),
      });
    } else {
      tracing::debug!(op, "distributed cache still failing: {}", error);
    }
  }

  fn distributed_succeeded(&self) {
    let was_down = self.distributed_down_until.lock().take().is_some();
    if was_down {
      tracing::info!("distributed cache recovered");
      self.emit(CacheEventKind::DistributedRecovered);
    }
  }

  /// Run a distributed-tier call under the operation timeout
  async fn call_distributed<T, F>(&self, op: &'static str, call: F) -> Option<T>
  where
    F: Future<Output = Result<T, CacheError>>,
  {
    match tokio::time::timeout(self.config.operation_timeout(), call).await {
      Ok(Ok(value)) => {
        self.distributed_succeeded();
        Some(value)
      }
      Ok(Err(e)) => {
        self.distributed_failed(op, &e.to_string());
        None
      }
      Err(_) => {
        self.distributed_failed(
          op,
          &format!("timed out after {}ms", self.config.operation_timeout_ms),
        );
        None
      }
    }
  }

  /// Remember a glob the distributed tier still has to drop
  async fn defer_invalidation(&self, glob: String) {
    let mut pending = self.pending.lock().await;
    if pending.len() >= MAX_PENDING_INVALIDATIONS {
      let everything = Invalidation::Pattern("*".into()).to_glob(&self.config.key_prefix);
      tracing::warn!(
        pending = pending.len(),
        "too many deferred invalidations, the whole prefix will be dropped"
      );
      pending.clear();
      pending.insert(everything);
    } else {
      pending.insert(glob);
    }
  }

  /// Replay deferred invalidations. Returns false while some are still
  /// outstanding, in which case the distributed tier must not be used.
  async fn flush_pending(&self, store: &Arc<dyn DistributedStore>) -> bool {
    let mut pending = self.pending.lock().await;
    while let Some(glob) = pending.first().cloned() {
      let batch_size = self.config.invalidate_batch_size.max(1);
      let done = self
        .call_distributed("invalidate", store.delete_matching(&glob, batch_size))
        .await;
      if done.is_none() {
        return false;
      }
      tracing::debug!(pattern = %glob, "deferred invalidation applied");
      pending.remove(&glob);
    }
    true
  }

  /// The distributed store, once it is reachable and caught up with every
  /// deferred invalidation
  async fn distributed_ready(&self) -> Option<Arc<dyn DistributedStore>> {
    let store = self.distributed()?;
    self.flush_pending(&store).await.then_some(store)
  }

  // -- reads --

  /// Cached value for `key`. Undecodable payloads are logged and reported
  /// as misses.
  pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
    match self.try_get(key).await {
      Ok(value) => value,
      Err(e) => {
        tracing::warn!(key = %key, "cached payload could not be decoded: {}", e);
        None
      }
    }
  }

  /// Like [`get`](Self::get) but surfaces decode failures
  pub async fn try_get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
    match self.get_raw(key).await {
      Some(raw) => Codec::decode(&raw).map(Some),
      None => Ok(None),
    }
  }

  /// Serialized (decompressed) payload for `key`
  pub async fn get_raw(&self, key: &CacheKey) -> Option<Bytes> {
    let storage_key = self.storage_key(key);

    if let Some(entry) = self.memory.get(&storage_key) {
      match Codec::unpack(&entry.value, entry.compressed) {
        Ok(raw) => {
          self.counters.memory_hit();
          tracing::trace!(key = %storage_key, "memory hit");
          return Some(raw);
        }
        Err(e) => {
          tracing::warn!(key = %storage_key, "dropping corrupt memory entry: {}", e);
          self.memory.remove(&storage_key);
        }
      }
    }

    if let Some(raw) = self.fetch_distributed(&storage_key).await {
      self.counters.distributed_hit();
      tracing::trace!(key = %storage_key, "distributed hit");
      return Some(raw);
    }

    self.counters.miss();
    None
  }

  async fn fetch_distributed(&self, storage_key: &str) -> Option<Bytes> {
    let store = self.distributed_ready().await?;
    let bytes = self.call_distributed("get", store.get(storage_key)).await??;

    let envelope = match Envelope::from_slice(&bytes) {
      Ok(envelope) => envelope,
      Err(e) => {
        tracing::warn!(key = %storage_key, "unreadable distributed entry: {}", e);
        return None;
      }
    };
    if envelope.is_expired() {
      return None;
    }
    let raw = match Codec::unpack(&envelope.data, envelope.compressed) {
      Ok(raw) => raw,
      Err(e) => {
        tracing::warn!(key = %storage_key, "unreadable distributed entry: {}", e);
        return None;
      }
    };

    // promote with whatever lifetime the distributed copy has left
    let ttl = envelope.remaining_ttl();
    let entry = CacheEntry::new(
      storage_key.to_string(),
      envelope.scope,
      envelope.data,
      envelope.compressed,
      ttl,
    );
    if let Err(e) = self.memory.insert(entry) {
      tracing::error!(key = %storage_key, "promotion into memory tier failed: {}", e);
    }
    Some(raw)
  }

  // -- writes --

  /// Store `value` under `key` in both tiers.
  ///
  /// `ttl == None` applies the configured default; a zero TTL stores the
  /// value without expiry. Only serialization failures and a violated memory
  /// capacity are reported; distributed-tier failures are logged.
  ///
  /// Concurrent `set`s for one key are not ordered against each other: the
  /// last one to complete wins in each tier.
  pub async fn set<T: Serialize + ?Sized>(
    &self,
    key: &CacheKey,
    value: &T,
    ttl: Option<Duration>,
  ) -> Result<(), CacheError> {
    let encoded = self.codec.encode(value)?;
    let ttl = effective_ttl(ttl.unwrap_or_else(|| self.config.default_ttl()));
    let storage_key = self.storage_key(key);

    let entry = CacheEntry::new(
      storage_key.clone(),
      key.scope().to_string(),
      encoded.bytes.clone(),
      encoded.compressed,
      ttl,
    );
    if let Err(e) = self.memory.insert(entry) {
      tracing::error!(key = %storage_key, "memory tier capacity violated: {}", e);
      return Err(e);
    }

    if self.distributed.is_some() {
      let written = match self.distributed_ready().await {
        Some(store) => match Envelope::new(key.scope(), &encoded, ttl).to_vec() {
          Ok(bytes) => self
            .call_distributed("set", store.set(&storage_key, bytes, ttl))
            .await
            .is_some(),
          Err(e) => {
            tracing::warn!(key = %storage_key, "could not encode distributed entry: {}", e);
            false
          }
        },
        None => false,
      };
      // an older distributed copy would otherwise outlive this value
      if !written {
        self.defer_invalidation(escape_glob(&storage_key)).await;
      }
    }

    tracing::trace!(
      key = %storage_key,
      bytes = encoded.bytes.len(),
      compressed = encoded.compressed,
      "cached"
    );
    Ok(())
  }

  /// Remove one key from both tiers. The distributed tier is tried even
  /// while it is cooling down; a failed delete is replayed later.
  pub async fn delete(&self, key: &CacheKey) -> bool {
    let storage_key = self.storage_key(key);
    let in_memory = self.memory.remove(&storage_key).is_some();
    let in_distributed = match &self.distributed {
      Some(store) => match self
        .call_distributed("delete", store.delete(&storage_key))
        .await
      {
        Some(found) => found,
        None => {
          self.defer_invalidation(escape_glob(&storage_key)).await;
          false
        }
      },
      None => false,
    };
    in_memory || in_distributed
  }

  /// Empty the memory tier
  pub fn clear(&self) {
    self.memory.clear();
  }

  /// Drop matching entries and return how many left the memory tier.
  ///
  /// The memory tier is clean when this returns. The distributed tier is
  /// cleared by a background SCAN/DEL task which is awaited for at most
  /// `operation_timeout_ms`; past that it keeps running detached. It is
  /// attempted even while the tier is cooling down, and a failure is
  /// replayed before the tier is used again.
  pub async fn invalidate(&self, target: Invalidation) -> usize {
    let pattern = target.to_glob(&self.config.key_prefix);

    let removed = match glob_to_regex(&pattern) {
      Ok(re) => self.memory.remove_matching(&re),
      Err(e) => {
        tracing::warn!(pattern = %pattern, "invalid invalidation pattern: {}", e);
        return 0;
      }
    };

    if let Some(store) = self.distributed.clone() {
      let batch_size = self.config.invalidate_batch_size.max(1);
      let task_pattern = pattern.clone();
      let task = tokio::spawn(async move { store.delete_matching(&task_pattern, batch_size).await });

      match tokio::time::timeout(self.config.operation_timeout(), task).await {
        Ok(Ok(Ok(n))) => {
          self.distributed_succeeded();
          tracing::debug!(pattern = %pattern, removed = n, "distributed entries invalidated");
        }
        Ok(Ok(Err(e))) => {
          self.distributed_failed("invalidate", &e.to_string());
          self.defer_invalidation(pattern.clone()).await;
        }
        Ok(Err(e)) => {
          tracing::warn!(pattern = %pattern, "distributed invalidation task failed: {}", e);
          self.defer_invalidation(pattern.clone()).await;
        }
        Err(_) => {
          tracing::debug!(pattern = %pattern, "distributed invalidation continuing in background")
        }
      }
    }

    tracing::debug!(pattern = %pattern, removed, "invalidated");
    removed
  }

  // -- maintenance --

  /// Remove expired memory entries
  pub fn purge_expired(&self) -> usize {
    let purged = self.memory.purge_expired();
    if purged > 0 {
      tracing::debug!(purged, "expired cache entries removed");
    }
    purged
  }

  pub fn stats(&self) -> CacheStats {
    let memory_hits = self.counters.memory_hits.load(Ordering::Relaxed);
    let distributed_hits = self.counters.distributed_hits.load(Ordering::Relaxed);
    let misses = self.counters.misses.load(Ordering::Relaxed);
    let total_requests = memory_hits + distributed_hits + misses;

    CacheStats {
      hit_rate: ratio(memory_hits + distributed_hits, total_requests),
      memory_hit_rate: ratio(memory_hits, total_requests),
      total_requests,
      memory_hits,
      distributed_hits,
      misses,
      evictions: self.memory.evictions(),
      expirations: self.memory.expirations(),
      size_bytes: self.memory.size_bytes(),
      items: self.memory.len(),
      max_items: self.memory.max_items(),
      distributed_errors: self.counters.distributed_errors.load(Ordering::Relaxed),
      distributed_available: self.distributed().is_some(),
    }
  }

  /// Log and publish aggregate metrics for the window since the last report
  pub fn emit_report(&self) -> CacheStats {
    let stats = self.stats();
    tracing::info!(
      hit_rate = stats.hit_rate,
      memory_hit_rate = stats.memory_hit_rate,
      requests = stats.total_requests,
      items = stats.items,
      size_bytes = stats.size_bytes,
      evictions = stats.evictions,
      distributed_errors = stats.distributed_errors,
      "cache report"
    );

    let alert = self.window.lock().observe(
      &stats,
      self.config.low_hit_rate_threshold,
      self.config.low_hit_rate_min_requests,
      self.config.low_hit_rate_windows,
    );

    self.emit(CacheEventKind::Report(stats.clone()));
    if let Some(alert) = alert {
      tracing::warn!(
        hit_rate = alert.hit_rate,
        threshold = alert.threshold,
        windows = alert.consecutive_windows,
        "cache hit rate is persistently low"
      );
      self.emit(CacheEventKind::LowHitRate(alert));
    }
    stats
  }

  // -- lifecycle --

  /// Start the expiry sweep and the statistics reporter. Calling it on a
  /// running manager is a no-op.
  pub fn start(self: &Arc<Self>) {
    let mut tasks = self.tasks.lock();
    if tasks.is_some() {
      return;
    }

    let token = CancellationToken::new();
    let handles = vec![
      spawn_periodic(
        Arc::downgrade(self),
        token.clone(),
        self.config.cleanup_interval(),
        |cache| {
          cache.purge_expired();
        },
      ),
      spawn_periodic(
        Arc::downgrade(self),
        token.clone(),
        self.config.stats_interval(),
        |cache| {
          cache.emit_report();
        },
      ),
    ];
    *tasks = Some(BackgroundTasks { token, handles });

    tracing::info!(
      cleanup_secs = self.config.cleanup_interval_secs,
      report_secs = self.config.stats_interval_secs,
      "cache background tasks started"
    );
  }

  /// Stop background tasks and wait for them to exit
  pub async fn stop(&self) {
    let tasks = self.tasks.lock().take();
    if let Some(tasks) = tasks {
      tasks.token.cancel();
      for handle in tasks.handles {
        let _ = handle.await;
      }
      tracing::info!("cache background tasks stopped");
    }
  }

  pub fn is_running(&self) -> bool {
    self.tasks.lock().is_some()
  }
}

impl Drop for CacheManager {
  fn drop(&mut self) {
    if let Some(tasks) = self.tasks.get_mut().take() {
      tasks.token.cancel();
    }
  }
}

/// Run `tick` every `period` until cancelled or the manager is dropped
fn spawn_periodic<F>(
  cache: Weak<CacheManager>,
  token: CancellationToken,
  period: Duration,
  tick: F,
) -> JoinHandle<()>
where
  F: Fn(&CacheManager) + Send + 'static,
{
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
      tokio::select! {
        _ = token.cancelled() => break,
        _ = interval.tick() => {
          let Some(manager) = cache.upgrade() else { break };
          tick(manager.as_ref());
        }
      }
    }
  })
}
