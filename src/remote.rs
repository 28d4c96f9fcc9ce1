//! L2: the shared remote cache and its connection manager
//!
//! [`RemoteStore`] is the raw key/value + pub/sub capability (Redis in
//! production, [`InMemoryStore`](crate::InMemoryStore) in tests).
//! [`RemoteCache`] layers entry encoding on top and turns transport failures
//! into "no remote result" so callers only ever see L1-degraded behaviour.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

use crate::config::{L2Config, RemoteProvider};
use crate::redis_store::RedisStore;
use crate::{CacheEntry, CacheError, InvalidationMessage, Serializer};

/// Pub/sub channel carrying invalidation messages.
pub const INVALIDATION_CHANNEL: &str = "tiercache:invalidation";

/// Raw payloads received on a subscription. The stream ends when the
/// underlying connection is lost.
pub type MessageStream = BoxStream<'static, Vec<u8>>;

/// Key/value store with pub/sub, shared by every process.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value`, expiring after `ttl_ms` milliseconds when given.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CacheError>;

    /// Open a subscription on its own connection.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, CacheError>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Entry-level view of the remote store.
///
/// Every operation is best effort: failures are logged and reported as a miss
/// or as `false`, never as an error.
pub struct RemoteCache {
    store: Arc<dyn RemoteStore>,
    serializer: Serializer,
}

impl RemoteCache {
    pub fn new(store: Arc<dyn RemoteStore>, serializer: Serializer) -> Self {
        Self { store, serializer }
    }

    /// Write an entry. Returns whether it reached the remote store.
    pub async fn set(&self, full_key: &str, entry: &CacheEntry) -> bool {
        let bytes = match self.serializer.serialize(entry) {
            Ok(b) => b,
            Err(e) => {
                warn!("L2 SET skipped for key {}: {}", full_key, e);
                return false;
            }
        };
        match self.store.set(full_key, bytes, entry.remote_ttl_ms()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("L2 SET error for key {}: {}. Continuing.", full_key, e);
                false
            }
        }
    }

    pub async fn get(&self, full_key: &str) -> Option<CacheEntry> {
        let bytes = match self.store.get(full_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("L2 GET error for key {}: {}. Treating as miss.", full_key, e);
                return None;
            }
        };
        match self.serializer.deserialize::<CacheEntry>(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(
                    "Failed to decode L2 entry for key {}: {}. Treating as miss.",
                    full_key, e
                );
                None
            }
        }
    }

    /// Remove an entry. Returns whether the delete reached the remote store.
    pub async fn delete(&self, full_key: &str) -> bool {
        match self.store.delete(full_key).await {
            Ok(()) => true,
            Err(e) => {
                warn!("L2 DEL error for key {}: {}. Continuing.", full_key, e);
                false
            }
        }
    }

    pub async fn exists(&self, full_key: &str) -> bool {
        self.store.exists(full_key).await.unwrap_or_else(|e| {
            warn!("L2 EXISTS error for key {}: {}", full_key, e);
            false
        })
    }

    /// Broadcast an invalidation. Returns whether it was published.
    pub async fn publish(&self, message: &InvalidationMessage) -> bool {
        let payload = match self.serializer.serialize(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode invalidation for {:?}: {}", message, e);
                return false;
            }
        };
        match self.store.publish(INVALIDATION_CHANNEL, payload).await {
            Ok(()) => {
                debug!(
                    "Cache invalidation published on channel '{}': {}:{}",
                    INVALIDATION_CHANNEL, message.category, message.key
                );
                true
            }
            Err(e) => {
                warn!(
                    "PUBLISH error on channel {} for {}:{}: {}. Continuing.",
                    INVALIDATION_CHANNEL, message.category, message.key, e
                );
                false
            }
        }
    }

    /// Subscribe to the invalidation channel. Unlike the other operations this
    /// reports failures, so the listener can back off and retry.
    pub async fn subscribe(&self) -> Result<MessageStream, CacheError> {
        self.store.subscribe(INVALIDATION_CHANNEL).await
    }

    pub fn decode_message(&self, payload: &[u8]) -> Result<InvalidationMessage, CacheError> {
        self.serializer.deserialize(payload)
    }
}

/// Owns the process-wide remote store and the [`RemoteCache`] built on it.
pub struct RemoteConnectionManager {
    cache: Arc<RemoteCache>,
    description: String,
}

impl RemoteConnectionManager {
    /// Connect to Redis as described by `config`.
    pub async fn connect(
        provider: RemoteProvider,
        config: &L2Config,
        serializer: Serializer,
    ) -> Result<Self, CacheError> {
        let store: Arc<dyn RemoteStore> = match provider {
            RemoteProvider::Redis => Arc::new(RedisStore::connect(config).await?),
        };
        Ok(Self::with_store(store, serializer))
    }

    /// Use an already constructed store.
    pub fn with_store(store: Arc<dyn RemoteStore>, serializer: Serializer) -> Self {
        let description = store.describe();
        info!(
            "Remote cache ready: {} (serializer: {})",
            description,
            serializer.as_str()
        );
        Self {
            cache: Arc::new(RemoteCache::new(store, serializer)),
            description,
        }
    }

    pub fn cache(&self) -> Arc<RemoteCache> {
        Arc::clone(&self.cache)
    }

    pub fn stop(&self) {
        info!("Remote cache stopped: {}", self.description);
    }
}
