//! Cache factory: owns the L1 registry, the L2 connection and the listener

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::listener::InvalidationListener;
use crate::local::{LocalCache, LocalCacheRegistry};
use crate::remote::{RemoteCache, RemoteConnectionManager, RemoteStore};
use crate::{CacheConfig, CacheError, CacheHandle, InvalidationMessage};

/// Process-wide cache context.
///
/// Create one per process with [`CacheFactory::start`], hand out
/// [`CacheHandle`]s from it, and call [`CacheFactory::stop`] on shutdown.
pub struct CacheFactory {
    config: CacheConfig,
    registry: Arc<LocalCacheRegistry>,
    remote: RemoteConnectionManager,
    listener: InvalidationListener,
    running: bool,
}

impl CacheFactory {
    /// Validate `config`, connect to Redis and start the invalidation listener.
    pub async fn start(config: CacheConfig) -> Result<Self, CacheError> {
        let (local, remote, serializer) = config.validate()?;
        let registry = Arc::new(LocalCacheRegistry::new(local, &config.l1));
        let remote = RemoteConnectionManager::connect(remote, &config.l2, serializer).await?;
        Self::finish_start(config, registry, remote)
    }

    /// Like [`CacheFactory::start`] but with a caller-supplied remote store.
    /// `l2.nodes` and the credentials are ignored.
    pub async fn start_with_store(
        config: CacheConfig,
        store: Arc<dyn RemoteStore>,
    ) -> Result<Self, CacheError> {
        let (local, _, serializer) = config.validate()?;
        let registry = Arc::new(LocalCacheRegistry::new(local, &config.l1));
        let remote = RemoteConnectionManager::with_store(store, serializer);
        Self::finish_start(config, registry, remote)
    }

    fn finish_start(
        config: CacheConfig,
        registry: Arc<LocalCacheRegistry>,
        remote: RemoteConnectionManager,
    ) -> Result<Self, CacheError> {
        let listener = InvalidationListener::start(
            remote.cache(),
            Arc::clone(&registry),
            config.listener.clone(),
            config.l1.negative_ttl_ms,
        )?;
        info!("tiercache factory started");
        Ok(Self {
            config,
            registry,
            remote,
            listener,
            running: true,
        })
    }

    /// Handle for `category` whose values never expire.
    ///
    /// Category names must be non-blank and may not contain `:`, the
    /// separator of the `category:key` storage key shared in L2. A name such
    /// as `user:profile` is rejected with [`CacheError::Config`]; use
    /// `user_profile` or similar instead.
    pub fn cache(&self, category: &str) -> Result<CacheHandle, CacheError> {
        self.handle(category, None)
    }

    /// Handle for `category` whose values expire `ttl` after each write.
    ///
    /// Same category rules as [`CacheFactory::cache`].
    pub fn cache_with_ttl(&self, category: &str, ttl: Duration) -> Result<CacheHandle, CacheError> {
        self.handle(category, Some(ttl))
    }

    fn handle(&self, category: &str, ttl: Option<Duration>) -> Result<CacheHandle, CacheError> {
        if !self.running {
            return Err(CacheError::config("cache factory is stopped"));
        }
        let local = self.registry.cache(category)?;
        CacheHandle::new(
            category,
            ttl,
            self.config.l1.negative_ttl_ms,
            local,
            self.remote.cache(),
        )
    }

    /// The L1 cache backing `category`, created if needed.
    pub fn local_cache(&self, category: &str) -> Result<Arc<LocalCache>, CacheError> {
        self.registry.cache(category)
    }

    pub fn remote_cache(&self) -> Arc<RemoteCache> {
        self.remote.cache()
    }

    /// Publish an invalidation for `(category, key)` without touching either tier.
    pub async fn broadcast(&self, message: &InvalidationMessage) -> bool {
        self.remote.cache().publish(message).await
    }

    pub fn listener(&self) -> &InvalidationListener {
        &self.listener
    }

    /// Categories that currently have an L1 cache.
    pub fn categories(&self) -> Vec<String> {
        self.registry.categories()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stop the listener, release the remote store and drop all L1 caches.
    ///
    /// Returns once the listener thread has exited, or once the bounded
    /// shutdown attempts are exhausted. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        self.listener.shutdown().await;
        self.remote.stop();
        self.registry.clear();
        info!("tiercache factory stopped");
    }
}
