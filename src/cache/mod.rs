//! Tiered response cache
//!
//! Provides a two-level cache with:
//! - A bounded in-process LRU tier (L1)
//! - An optional Redis-backed distributed tier (L2) with promotion on hit
//! - Deterministic key derivation from logical requests
//! - Transparent zlib compression of large payloads
//! - Periodic expiry sweeps and hit rate reporting over a broadcast channel

pub mod codec;
pub mod config;
pub mod distributed;
mod entry;
mod error;
mod events;
mod key;
mod manager;
pub mod memory;
mod stats;

pub use config::{CacheConfig, RedisConfig};
pub use distributed::{DistributedStore, RedisStore};
pub use entry::CacheEntry;
pub use error::CacheError;
pub use events::{CacheEvent, CacheEventKind};
pub use key::CacheKey;
pub use manager::{CacheManager, Invalidation};
pub use memory::{escape_glob, glob_to_regex, MemoryTier};
pub use stats::{CacheStats, LowHitRate};
