//! L1: per-category in-memory caches

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use moka::future::Cache;
use tracing::debug;

use crate::config::{L1Config, LocalProvider};
use crate::entry::validate_category;
use crate::{CacheEntry, CacheError};

/// In-memory cache for a single category, keyed by full key.
pub struct LocalCache {
    inner: Cache<String, Arc<CacheEntry>>,
}

impl LocalCache {
    pub fn new(max_size: u64, expire_after_write: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_size)
            .time_to_live(expire_after_write)
            .build();
        Self { inner }
    }

    pub async fn set(&self, full_key: &str, entry: CacheEntry) {
        self.inner.insert(full_key.to_owned(), Arc::new(entry)).await;
    }

    pub async fn get(&self, full_key: &str) -> Option<Arc<CacheEntry>> {
        self.inner.get(full_key).await
    }

    pub async fn delete(&self, full_key: &str) {
        self.inner.invalidate(full_key).await;
    }

    /// `None` when the key was never cached locally, otherwise whether the
    /// local entry holds a live value.
    pub async fn exists(&self, full_key: &str) -> Option<bool> {
        self.get(full_key)
            .await
            .map(|entry| !entry.is_negative() && entry.is_valid())
    }

    /// Approximate number of entries, for diagnostics.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

/// Owns one [`LocalCache`] per category, created on first use.
pub struct LocalCacheRegistry {
    provider: LocalProvider,
    max_size: u64,
    expire_after_write: Duration,
    caches: DashMap<String, Arc<LocalCache>>,
}

impl LocalCacheRegistry {
    pub fn new(provider: LocalProvider, config: &L1Config) -> Self {
        Self {
            provider,
            max_size: config.max_size,
            expire_after_write: config.expire_after_write(),
            caches: DashMap::new(),
        }
    }

    /// Get the cache for `category`, creating it if needed.
    ///
    /// Concurrent first calls for the same category all receive the single
    /// instance inserted by whichever caller won the entry lock.
    pub fn cache(&self, category: &str) -> Result<Arc<LocalCache>, CacheError> {
        if let Some(cache) = self.caches.get(category) {
            return Ok(Arc::clone(cache.value()));
        }
        validate_category(category)?;

        let cache = self
            .caches
            .entry(category.to_owned())
            .or_insert_with(|| {
                debug!("Creating L1 cache for category: {}", category);
                Arc::new(self.create())
            });
        Ok(Arc::clone(cache.value()))
    }

    fn create(&self) -> LocalCache {
        match self.provider {
            LocalProvider::Moka => LocalCache::new(self.max_size, self.expire_after_write),
        }
    }

    /// Names of the categories that have a local cache.
    pub fn categories(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop every local cache.
    pub fn clear(&self) {
        self.caches.clear();
    }
}
