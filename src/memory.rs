//! In-process [`RemoteStore`]
//!
//! A TTL-aware map with broadcast pub/sub. Several factories sharing one
//! `InMemoryStore` behave like processes sharing one Redis, which makes it
//! the natural test double; it also serves single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::CacheError;
use crate::remote::{MessageStream, RemoteStore};

const CHANNEL_CAPACITY: usize = 1024;

struct StoredValue {
    bytes: Vec<u8>,
    ttl_ms: Option<u64>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    publishes: AtomicU64,
    subscribes: AtomicU64,
}

/// Shared in-memory key/value store with pub/sub.
pub struct InMemoryStore {
    values: Mutex<HashMap<String, StoredValue>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    available: AtomicBool,
    counters: Counters,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    /// Simulate an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop every open subscription, as a lost connection would.
    pub fn disconnect_subscribers(&self) {
        lock(&self.channels).clear();
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.channels)
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// TTL a live key was stored with: `None` if absent, `Some(None)` if it
    /// never expires.
    pub fn ttl_ms(&self, key: &str) -> Option<Option<u64>> {
        lock(&self.values)
            .get(key)
            .filter(|v| v.is_live())
            .map(|v| v.ttl_ms)
    }

    /// Number of `get` calls served, including failed ones.
    pub fn get_count(&self) -> u64 {
        self.counters.gets.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> u64 {
        self.counters.sets.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.counters.deletes.load(Ordering::SeqCst)
    }

    pub fn publish_count(&self) -> u64 {
        self.counters.publishes.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> u64 {
        self.counters.subscribes.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Transport("in-memory store unavailable".to_owned()))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let mut values = lock(&self.values);
        if values.get(key).is_some_and(|v| !v.is_live()) {
            values.remove(key);
        }
        Ok(values.get(key).map(|v| v.bytes.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<(), CacheError> {
        self.counters.sets.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let expires_at = ttl_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        lock(&self.values).insert(
            key.to_owned(),
            StoredValue {
                bytes: value,
                ttl_ms,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;
        lock(&self.values).remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_available()?;
        Ok(lock(&self.values).get(key).is_some_and(StoredValue::is_live))
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CacheError> {
        self.counters.publishes.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;
        if let Some(tx) = lock(&self.channels).get(channel) {
            // No receivers is not an error, same as PUBLISH returning 0.
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, CacheError> {
        self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let rx = lock(&self.channels)
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("In-memory subscriber lagged, {} messages skipped", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    fn describe(&self) -> String {
        "in-memory store".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store.set("k", b"v".to_vec(), Some(30)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get_count(), 2);
    }

    #[tokio::test]
    async fn test_pubsub_and_disconnect() {
        let store = InMemoryStore::new();
        let mut stream = store.subscribe("ch").await.unwrap();
        assert_eq!(store.subscriber_count("ch"), 1);

        store.publish("ch", b"hello".to_vec()).await.unwrap();
        assert_eq!(stream.next().await, Some(b"hello".to_vec()));

        store.disconnect_subscribers();
        assert_eq!(stream.next().await, None);
        assert_eq!(store.subscriber_count("ch"), 0);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(CacheError::Transport(_))));
        assert!(store.subscribe("ch").await.is_err());
        assert_eq!(store.get_count(), 1);
    }
}
