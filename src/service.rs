use std::sync::Arc;

use crate::cache::{CacheManager, DistributedStore, RedisStore};
use crate::config::Config;
use crate::db::{mask_password, ConnectionPoolManager};
use crate::query::QueryOptimizer;

/// The assembled data layer: cache, pools and optimizer.
///
/// Build one per process with [`DataLayer::connect`] and share it by
/// reference or `Arc`.
pub struct DataLayer {
  optimizer: QueryOptimizer,
}

impl DataLayer {
  /// Connect to Redis and the database and open the pools.
  ///
  /// An unreachable Redis only disables the distributed tier. A database
  /// that cannot be reached fails the whole call.
  pub async fn connect(config: &Config) -> Result<Self, anyhow::Error> {
    let cache = if config.redis.enabled {
      match RedisStore::connect(&config.redis).await {
        Ok(store) => {
          tracing::info!(
            url = %mask_password(&config.redis.connection_url()),
            "distributed cache connected"
          );
          let store: Arc<dyn DistributedStore> = Arc::new(store);
          CacheManager::with_distributed(config.cache.clone(), store)
        }
        Err(e) => {
          tracing::warn!("distributed cache unavailable, using memory only: {}", e);
          CacheManager::new(config.cache.clone())
        }
      }
    } else {
      CacheManager::new(config.cache.clone())
    };

    let pools = Arc::new(ConnectionPoolManager::new());
    pools
      .initialize(&config.database.url, config.database.pool.clone())
      .await?;

    Ok(Self::from_parts(Arc::new(cache), pools, config))
  }

  /// Assemble from components that are already set up
  pub fn from_parts(cache: Arc<CacheManager>, pools: Arc<ConnectionPoolManager>, config: &Config) -> Self {
    Self {
      optimizer: QueryOptimizer::new(pools, cache, config.optimizer.clone()),
    }
  }

  /// Start the cache background tasks
  pub fn start(&self) {
    self.optimizer.cache().start();
  }

  /// Stop background work and close the pools
  pub async fn shutdown(&self) {
    self.optimizer.cache().stop().await;
    self.optimizer.pools().close().await;
    tracing::info!("data layer shut down");
  }

  pub fn cache(&self) -> &Arc<CacheManager> {
    self.optimizer.cache()
  }

  pub fn optimizer(&self) -> &QueryOptimizer {
    &self.optimizer
  }

  pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
    self.optimizer.pools()
  }
}
