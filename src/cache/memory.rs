//! In-process (L1) cache tier

use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use super::entry::CacheEntry;
use super::error::CacheError;

/// Bounded LRU store for encoded entries
///
/// Every operation takes the single tier lock for its whole duration, so an
/// entry read back is always exactly the one last written. Inserting into a
/// full tier evicts exactly one entry, the least recently accessed one.
pub struct MemoryTier {
  entries: Mutex<LruCache<String, CacheEntry>>,
  max_items: usize,
  memory_used: AtomicUsize,
  evictions: AtomicU64,
  expirations: AtomicU64,
}

impl MemoryTier {
  pub fn new(max_items: usize) -> Self {
    let capacity = NonZeroUsize::new(max_items).unwrap_or(NonZeroUsize::MIN);
    Self {
      entries: Mutex::new(LruCache::new(capacity)),
      max_items: capacity.get(),
      memory_used: AtomicUsize::new(0),
      evictions: AtomicU64::new(0),
      expirations: AtomicU64::new(0),
    }
  }

  /// Live entry for `key`, marking it most recently used.
  /// An expired entry is dropped on the spot and reported as absent.
  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    let mut entries = self.entries.lock();
    match entries.get_mut(key) {
      None => return None,
      Some(entry) if !entry.is_expired() => {
        entry.touch();
        return Some(entry.clone());
      }
      Some(_) => {}
    }
    if let Some(entry) = entries.pop(key) {
      self.memory_used.fetch_sub(entry.size_bytes, Ordering::Relaxed);
      self.expirations.fetch_add(1, Ordering::Relaxed);
    }
    None
  }

  /// Insert or replace an entry.
  ///
  /// Returns the entry evicted to make room, if any.
  pub fn insert(&self, entry: CacheEntry) -> Result<Option<CacheEntry>, CacheError> {
    let mut entries = self.entries.lock();
    let key = entry.key.clone();
    let added = entry.size_bytes;

    let displaced = entries.push(key.clone(), entry);
    self.memory_used.fetch_add(added, Ordering::Relaxed);

    let evicted = match displaced {
      Some((old_key, old)) => {
        self.memory_used.fetch_sub(old.size_bytes, Ordering::Relaxed);
        if old_key == key {
          None
        } else {
          self.evictions.fetch_add(1, Ordering::Relaxed);
          tracing::trace!(key = %old_key, "evicted least recently used entry");
          Some(old)
        }
      }
      None => None,
    };

    let len = entries.len();
    if len > self.max_items {
      return Err(CacheError::EvictionInvariant {
        len,
        max: self.max_items,
      });
    }
    Ok(evicted)
  }

  pub fn remove(&self, key: &str) -> Option<CacheEntry> {
    let removed = self.entries.lock().pop(key);
    if let Some(entry) = &removed {
      self.memory_used.fetch_sub(entry.size_bytes, Ordering::Relaxed);
    }
    removed
  }

  /// Remove every entry whose key matches `pattern`
  pub fn remove_matching(&self, pattern: &Regex) -> usize {
    let mut entries = self.entries.lock();
    let keys: Vec<String> = entries
      .iter()
      .filter(|(k, _)| pattern.is_match(k))
      .map(|(k, _)| k.clone())
      .collect();

    let mut removed = 0;
    for key in keys {
      if let Some(entry) = entries.pop(&key) {
        self.memory_used.fetch_sub(entry.size_bytes, Ordering::Relaxed);
        removed += 1;
      }
    }
    removed
  }

  /// Drop expired entries, returning how many went
  pub fn purge_expired(&self) -> usize {
    let now = Instant::now();
    let mut entries = self.entries.lock();
    let expired_keys: Vec<String> = entries
      .iter()
      .filter(|(_, entry)| entry.is_expired_at(now))
      .map(|(k, _)| k.clone())
      .collect();

    let count = expired_keys.len();
    for key in expired_keys {
      if let Some(entry) = entries.pop(&key) {
        self.memory_used.fetch_sub(entry.size_bytes, Ordering::Relaxed);
        self.expirations.fetch_add(1, Ordering::Relaxed);
      }
    }
    count
  }

  pub fn clear(&self) {
    self.entries.lock().clear();
    self.memory_used.store(0, Ordering::Relaxed);
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn max_items(&self) -> usize {
    self.max_items
  }

  pub fn size_bytes(&self) -> usize {
    self.memory_used.load(Ordering::Relaxed)
  }

  pub fn evictions(&self) -> u64 {
    self.evictions.load(Ordering::Relaxed)
  }

  pub fn expirations(&self) -> u64 {
    self.expirations.load(Ordering::Relaxed)
  }

  /// Key that the next insertion into a full tier would evict
  pub fn lru_key(&self) -> Option<String> {
    self.entries.lock().peek_lru().map(|(k, _)| k.clone())
  }
}

/// Escape glob metacharacters so `s` matches only itself
pub fn escape_glob(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    if matches!(c, '*' | '?' | '[' | ']' | '\\') {
      out.push('\\');
    }
    out.push(c);
  }
  out
}

/// Convert a Redis-style glob pattern to an anchored regex.
///
/// Supports `*`, `?`, `[...]` classes (with `^` negation) and backslash
/// escapes, so that L1 matching agrees with the distributed tier's `SCAN MATCH`.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
  let mut regex_str = String::with_capacity(pattern.len() * 2);
  regex_str.push('^');

  let mut chars = pattern.chars().peekable();
  while let Some(c) = chars.next() {
    match c {
      '*' => regex_str.push_str(".*"),
      '?' => regex_str.push('.'),
      '\\' => match chars.next() {
        Some(escaped) => regex_str.push_str(&regex::escape(&escaped.to_string())),
        None => regex_str.push_str("\\\\"),
      },
      '[' => {
        let mut class = String::new();
        let mut literal = String::from("[");
        let mut closed = false;
        if chars.peek() == Some(&'^') {
          chars.next();
          class.push('^');
          literal.push('^');
        }
        while let Some(cc) = chars.next() {
          literal.push(cc);
          match cc {
            ']' => {
              closed = true;
              break;
            }
            '-' => class.push('-'),
            '\\' => {
              if let Some(escaped) = chars.next() {
                literal.push(escaped);
                class.push_str(&regex::escape(&escaped.to_string()));
              }
            }
            other => class.push_str(&regex::escape(&other.to_string())),
          }
        }
        if closed && !class.is_empty() && class != "^" {
          regex_str.push('[');
          regex_str.push_str(&class);
          regex_str.push(']');
        } else {
          regex_str.push_str(&regex::escape(&literal));
        }
      }
      other => regex_str.push_str(&regex::escape(&other.to_string())),
    }
  }

  regex_str.push('$');
  Regex::new(&regex_str)
}
