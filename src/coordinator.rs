//! Read-through / write-through coordination of L1 and L2

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::entry::full_key;
use crate::local::LocalCache;
use crate::remote::RemoteCache;
use crate::{CacheEntry, CacheError, InvalidationMessage};

/// Cache handle for one category.
///
/// Writes go to L1, then L2, then out as an invalidation broadcast so every
/// other process refreshes its L1 from L2. Reads try L1, then L2, and cache
/// confirmed misses in L1.
///
/// L2 failures never surface here: a write that fails to reach L2 stays
/// local and is not broadcast; a read that fails is treated as a miss.
#[derive(Clone)]
pub struct CacheHandle {
    category: Arc<str>,
    ttl_ms: Option<u64>,
    negative_ttl_ms: Option<u64>,
    local: Arc<LocalCache>,
    remote: Arc<RemoteCache>,
}

impl CacheHandle {
    pub(crate) fn new(
        category: &str,
        ttl: Option<Duration>,
        negative_ttl_ms: Option<u64>,
        local: Arc<LocalCache>,
        remote: Arc<RemoteCache>,
    ) -> Result<Self, CacheError> {
        let ttl_ms = match ttl {
            Some(ttl) if ttl.is_zero() => {
                return Err(CacheError::config("cache ttl must be greater than zero"));
            }
            Some(ttl) => Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)),
            None => None,
        };
        Ok(Self {
            category: Arc::from(category),
            ttl_ms,
            negative_ttl_ms,
            local,
            remote,
        })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// TTL applied to values written through this handle, `None` for no expiry.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    fn full_key(&self, key: &str) -> Result<String, CacheError> {
        full_key(&self.category, key)
    }

    /// Store `value` under `key`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let full_key = self.full_key(key)?;
        let value = serde_json::to_value(value)?;
        if value.is_null() {
            return Err(CacheError::serialization(
                "cannot cache a null value, use delete instead",
            ));
        }
        let entry = CacheEntry::new(Some(value), self.ttl_ms);

        self.local.set(&full_key, entry.clone()).await;
        debug!("Cache set L1 for key: {}", full_key);

        if self.remote.set(&full_key, &entry).await {
            debug!("Cache set L2 for key: {}", full_key);
            self.broadcast(key).await;
        }
        Ok(())
    }

    /// Read `key`, returning `None` when it is absent or expired.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let full_key = self.full_key(key)?;
        match self.load(&full_key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn load(&self, full_key: &str) -> Option<serde_json::Value> {
        if let Some(entry) = self.local.get(full_key).await {
            // Expired L1 entries are a local decision; L2 is not consulted.
            if !entry.is_valid() {
                debug!("Cache hit L1 (expired) for key: {}", full_key);
                return None;
            }
            debug!("Cache hit L1 for key: {}", full_key);
            return entry.value.clone();
        }

        debug!("Cache miss L1 for key: {}", full_key);

        match self.remote.get(full_key).await {
            Some(entry) => {
                // L2 enforces the TTL itself, so no validity check here.
                debug!("Cache hit L2 for key: {}", full_key);
                let value = entry.value.clone();
                self.local.set(full_key, entry).await;
                value
            }
            None => {
                debug!("Cache miss L2 for key: {}, caching negative entry", full_key);
                self.local
                    .set(full_key, CacheEntry::negative(self.negative_ttl_ms))
                    .await;
                None
            }
        }
    }

    /// Remove `key` from both tiers.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let full_key = self.full_key(key)?;

        self.local.delete(&full_key).await;
        debug!("Cache delete L1 for key: {}", full_key);

        if self.remote.delete(&full_key).await {
            debug!("Cache delete L2 for key: {}", full_key);
            self.broadcast(key).await;
        }
        Ok(())
    }

    /// Whether `key` currently holds a live value.
    ///
    /// When L1 has never seen the key, it is loaded first (one L2 read) so
    /// the answer always comes from a freshly populated L1 entry.
    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let full_key = self.full_key(key)?;
        if let Some(exists) = self.local.exists(&full_key).await {
            return Ok(exists);
        }
        self.load(&full_key).await;
        Ok(self.local.exists(&full_key).await.unwrap_or(false))
    }

    async fn broadcast(&self, key: &str) {
        self.remote
            .publish(&InvalidationMessage::new(&*self.category, key))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteStore;
    use crate::{InMemoryStore, Serializer};
    use serde::Deserialize;

    struct Fixture {
        store: Arc<InMemoryStore>,
        local: Arc<LocalCache>,
    }

    fn handle(ttl: Option<Duration>) -> (CacheHandle, Fixture) {
        let store = Arc::new(InMemoryStore::new());
        let remote = Arc::new(RemoteCache::new(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            Serializer::Json,
        ));
        let local = Arc::new(LocalCache::new(1000, Duration::from_secs(600)));
        let handle =
            CacheHandle::new("person", ttl, None, Arc::clone(&local), remote).unwrap();
        (handle, Fixture { store, local })
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Person {
        name: String,
        age: u32,
    }

    #[tokio::test]
    async fn test_round_trip_structured_value() {
        let (cache, _f) = handle(Some(Duration::from_secs(30)));
        let alice = Person {
            name: "alice".to_owned(),
            age: 30,
        };
        cache.set("p1", &alice).await.unwrap();
        assert_eq!(cache.get::<Person>("p1").await.unwrap(), Some(alice));
    }

    #[tokio::test]
    async fn test_set_writes_both_tiers_and_broadcasts() {
        let (cache, f) = handle(Some(Duration::from_secs(30)));
        cache.set("p1", "alice").await.unwrap();

        assert_eq!(f.local.exists("person:p1").await, Some(true));
        assert_eq!(f.store.ttl_ms("person:p1"), Some(Some(30_000)));
        assert_eq!(f.store.set_count(), 1);
        assert_eq!(f.store.publish_count(), 1);

        cache.delete("p1").await.unwrap();
        assert_eq!(f.local.exists("person:p1").await, None);
        assert_eq!(f.store.ttl_ms("person:p1"), None);
        assert_eq!(f.store.delete_count(), 1);
        assert_eq!(f.store.publish_count(), 2);
    }

    #[tokio::test]
    async fn test_no_broadcast_when_l2_write_fails() {
        let (cache, f) = handle(None);
        f.store.set_available(false);

        cache.set("p1", "alice").await.unwrap();
        assert_eq!(f.store.set_count(), 1);
        assert_eq!(f.store.publish_count(), 0);
        // Still served from L1.
        assert_eq!(cache.get::<String>("p1").await.unwrap().as_deref(), Some("alice"));

        cache.delete("p1").await.unwrap();
        assert_eq!(f.store.delete_count(), 1);
        assert_eq!(f.store.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_l1_entry_does_not_fall_through() {
        let (cache, f) = handle(Some(Duration::from_millis(50)));
        cache.set("p1", "alice").await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get::<String>("p1").await.unwrap().as_deref(), Some("alice"));

        tokio::time::sleep(Duration::from_millis(90)).await;
        let reads = f.store.get_count();
        assert_eq!(cache.get::<String>("p1").await.unwrap(), None);
        assert_eq!(f.store.get_count(), reads);
    }

    #[tokio::test]
    async fn test_lazy_fill_from_l2() {
        let (cache, f) = handle(None);
        let entry = CacheEntry::new(Some("bob".into()), Some(30_000));
        f.store
            .set(
                "person:p2",
                Serializer::Json.serialize(&entry).unwrap(),
                Some(30_000),
            )
            .await
            .unwrap();

        assert_eq!(cache.get::<String>("p2").await.unwrap().as_deref(), Some("bob"));
        assert_eq!(f.local.get("person:p2").await.as_deref(), Some(&entry));
        assert_eq!(cache.get::<String>("p2").await.unwrap().as_deref(), Some("bob"));
        assert_eq!(f.store.get_count(), 1);
    }

    #[tokio::test]
    async fn test_negative_caching() {
        let (cache, f) = handle(None);
        assert_eq!(cache.get::<String>("missing").await.unwrap(), None);
        assert_eq!(cache.get::<String>("missing").await.unwrap(), None);
        assert_eq!(f.store.get_count(), 1);
        assert!(f.local.get("person:missing").await.unwrap().is_negative());
    }

    #[tokio::test]
    async fn test_exists() {
        let (cache, f) = handle(Some(Duration::from_secs(30)));

        assert!(!cache.exists("p1").await.unwrap());
        assert_eq!(f.store.get_count(), 1);

        cache.set("p1", "alice").await.unwrap();
        assert!(cache.exists("p1").await.unwrap());

        cache.delete("p1").await.unwrap();
        let reads = f.store.get_count();
        assert!(!cache.exists("p1").await.unwrap());
        assert_eq!(f.store.get_count(), reads + 1);
    }

    #[tokio::test]
    async fn test_invalid_input() {
        let (cache, _f) = handle(None);
        assert!(matches!(cache.set("", "x").await, Err(CacheError::Config(_))));
        assert!(matches!(cache.get::<String>("").await, Err(CacheError::Config(_))));
        assert!(matches!(cache.delete("").await, Err(CacheError::Config(_))));
        assert!(matches!(cache.exists("").await, Err(CacheError::Config(_))));
        assert!(matches!(cache.set("   ", "x").await, Err(CacheError::Config(_))));
        assert!(matches!(cache.get::<String>("\t").await, Err(CacheError::Config(_))));
        assert!(matches!(
            cache.set("p1", &Option::<String>::None).await,
            Err(CacheError::Serialization(_))
        ));

        cache.set("p1", "alice").await.unwrap();
        assert!(matches!(
            cache.get::<u32>("p1").await,
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let remote = Arc::new(RemoteCache::new(
            Arc::new(InMemoryStore::new()) as Arc<dyn RemoteStore>,
            Serializer::Json,
        ));
        let local = Arc::new(LocalCache::new(10, Duration::from_secs(1)));
        assert!(matches!(
            CacheHandle::new("person", Some(Duration::ZERO), None, local, remote),
            Err(CacheError::Config(_))
        ));
    }
}
