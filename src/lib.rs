//! tiercache - Two-tier caching library
//!
//! Values are read and written through two tiers:
//! - L1: per-category in-memory Moka caches (fastest, per process)
//! - L2: Redis, single node or cluster (shared across processes)
//!
//! Every successful write or delete publishes a small `{category, key}`
//! notice on a Redis pub/sub channel. A dedicated listener thread in each
//! process re-reads the key from L2 and refreshes its own L1, so all
//! processes converge on the L2 state.
//!
//! The cache supports:
//! - Read-through with lazy L1 fill and negative caching of misses
//! - Per-handle TTLs carried inside each entry
//! - Graceful degradation to L1-only operation when Redis is unreachable
//! - Pluggable serializers (JSON, MessagePack) and remote stores
//!
//! ```no_run
//! # async fn demo() -> Result<(), tiercache::CacheError> {
//! use std::time::Duration;
//! use tiercache::{CacheConfig, CacheFactory};
//!
//! let mut config = CacheConfig::default();
//! config.l2.nodes = "127.0.0.1:6379".to_owned();
//!
//! let mut factory = CacheFactory::start(config).await?;
//! let people = factory.cache_with_ttl("person", Duration::from_secs(30))?;
//!
//! people.set("p1", "alice").await?;
//! assert_eq!(people.get::<String>("p1").await?.as_deref(), Some("alice"));
//!
//! factory.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod coordinator;
pub mod entry;
mod error;
mod factory;
pub mod listener;
pub mod local;
mod memory;
pub mod redis_store;
pub mod remote;
mod serializer;

pub use config::CacheConfig;
pub use coordinator::CacheHandle;
pub use entry::{CacheEntry, InvalidationMessage};
pub use error::CacheError;
pub use factory::CacheFactory;
pub use memory::InMemoryStore;
pub use remote::{INVALIDATION_CHANNEL, RemoteStore};
pub use serializer::Serializer;

// Re-export async_trait for custom RemoteStore implementations
pub use async_trait::async_trait;
