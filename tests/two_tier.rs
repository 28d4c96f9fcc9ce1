//! End-to-end behaviour of factories sharing one remote store, the way
//! several processes share one Redis.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tiercache::config::ListenerConfig;
use tiercache::listener::ListenerState;
use tiercache::{
    CacheConfig, CacheError, CacheFactory, INVALIDATION_CHANNEL, InMemoryStore, RemoteStore,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> CacheConfig {
    CacheConfig {
        listener: ListenerConfig {
            backoff_ms: 20,
            shutdown_grace_ms: 500,
            shutdown_attempts: 2,
        },
        ..Default::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn start_nodes(store: &Arc<InMemoryStore>, n: usize) -> Vec<CacheFactory> {
    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        let shared = Arc::clone(store) as Arc<dyn RemoteStore>;
        nodes.push(CacheFactory::start_with_store(config(), shared).await.unwrap());
    }
    eventually(|| store.subscriber_count(INVALIDATION_CHANNEL) == n).await;
    nodes
}

#[tokio::test]
async fn test_person_scenario() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut nodes = start_nodes(&store, 1).await;
    let factory = &nodes[0];

    let people = factory
        .cache_with_ttl("person", Duration::from_millis(30_000))
        .unwrap();
    assert_eq!(people.category(), "person");
    assert_eq!(people.ttl(), Some(Duration::from_secs(30)));

    people.set("p1", "alice").await.unwrap();
    assert_eq!(people.get::<String>("p1").await.unwrap().as_deref(), Some("alice"));
    assert!(people.exists("p1").await.unwrap());

    people.delete("p1").await.unwrap();
    assert_eq!(people.get::<String>("p1").await.unwrap(), None);
    assert!(!people.exists("p1").await.unwrap());

    nodes[0].stop().await;
}

#[tokio::test]
async fn test_write_propagates_to_other_node() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut nodes = start_nodes(&store, 2).await;

    let on_a = nodes[0].cache_with_ttl("person", Duration::from_secs(30)).unwrap();
    let on_b = nodes[1].cache_with_ttl("person", Duration::from_secs(30)).unwrap();

    // B caches a confirmed miss first.
    assert_eq!(on_b.get::<String>("p1").await.unwrap(), None);

    on_a.set("p1", "v1").await.unwrap();
    let (a, b) = (&nodes[0], &nodes[1]);
    eventually(|| {
        a.listener().messages_processed() >= 1 && b.listener().messages_processed() >= 1
    })
    .await;

    let local_b = nodes[1].local_cache("person").unwrap();
    let entry = local_b.get("person:p1").await.unwrap();
    assert_eq!(entry.value, Some("v1".into()));

    let reads = store.get_count();
    assert_eq!(on_b.get::<String>("p1").await.unwrap().as_deref(), Some("v1"));
    assert_eq!(store.get_count(), reads);

    nodes[0].stop().await;
    nodes[1].stop().await;
}

#[tokio::test]
async fn test_delete_propagates_to_other_node() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut nodes = start_nodes(&store, 2).await;

    let on_a = nodes[0].cache("order").unwrap();
    let on_b = nodes[1].cache("order").unwrap();

    on_a.set("o1", &vec![1, 2, 3]).await.unwrap();
    let b = &nodes[1];
    eventually(|| b.listener().messages_processed() >= 1).await;
    assert_eq!(on_b.get::<Vec<u32>>("o1").await.unwrap(), Some(vec![1, 2, 3]));

    on_a.delete("o1").await.unwrap();
    eventually(|| b.listener().messages_processed() >= 2).await;
    assert_eq!(on_b.get::<Vec<u32>>("o1").await.unwrap(), None);
    assert!(!on_b.exists("o1").await.unwrap());

    nodes[0].stop().await;
    nodes[1].stop().await;
}

#[tokio::test]
async fn test_l2_outage_degrades_to_local() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut nodes = start_nodes(&store, 2).await;
    let on_a = nodes[0].cache("person").unwrap();
    let on_b = nodes[1].cache("person").unwrap();

    store.set_available(false);
    on_a.set("p1", "alice").await.unwrap();
    assert_eq!(on_a.get::<String>("p1").await.unwrap().as_deref(), Some("alice"));
    assert_eq!(on_b.get::<String>("p1").await.unwrap(), None);
    store.set_available(true);

    nodes[0].stop().await;
    nodes[1].stop().await;
}

#[tokio::test]
async fn test_messagepack_serializer() {
    let store = Arc::new(InMemoryStore::new());
    let mut config = config();
    config.l2.serializer = "msgpack".to_owned();
    let mut factory =
        CacheFactory::start_with_store(config, Arc::clone(&store) as Arc<dyn RemoteStore>)
            .await
            .unwrap();
    eventually(|| store.subscriber_count(INVALIDATION_CHANNEL) == 1).await;

    let cache = factory.cache("person").unwrap();
    cache.set("p1", &("alice", 30)).await.unwrap();
    assert_eq!(
        cache.get::<(String, u32)>("p1").await.unwrap(),
        Some(("alice".to_owned(), 30))
    );
    let listener = factory.listener();
    eventually(|| listener.messages_processed() == 1).await;

    factory.stop().await;
}

#[test]
fn test_concurrent_category_access_yields_one_cache() {
    let store = Arc::new(InMemoryStore::new()) as Arc<dyn RemoteStore>;
    let mut factory =
        tokio_test::block_on(CacheFactory::start_with_store(config(), store)).unwrap();

    let caches = std::thread::scope(|s| {
        let handles: Vec<_> = (0..32)
            .map(|_| s.spawn(|| factory.local_cache("person").unwrap()))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });
    assert!(caches.iter().all(|c| Arc::ptr_eq(c, &caches[0])));

    let other = factory.local_cache("order").unwrap();
    assert!(!Arc::ptr_eq(&other, &caches[0]));
    assert_eq!(factory.categories().len(), 2);

    tokio_test::block_on(factory.stop());
}

#[tokio::test]
async fn test_stop_unblocks_listener() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut nodes = start_nodes(&store, 1).await;
    let mut factory = nodes.remove(0);
    assert!(factory.is_running());
    assert!(factory.listener().is_running());
    assert_eq!(factory.listener().state(), ListenerState::Subscribing);

    factory.stop().await;

    assert!(!factory.is_running());
    assert!(!factory.listener().is_running());
    assert_eq!(factory.listener().state(), ListenerState::Terminated);
    assert_eq!(store.subscriber_count(INVALIDATION_CHANNEL), 0);
    assert!(factory.categories().is_empty());
    assert!(matches!(factory.cache("person"), Err(CacheError::Config(_))));

    factory.stop().await;
}

#[tokio::test]
async fn test_invalid_configuration_fails_fast() {
    let store = Arc::new(InMemoryStore::new()) as Arc<dyn RemoteStore>;
    let mut bad = config();
    bad.l1.provider = "caffeine".to_owned();
    assert!(matches!(
        CacheFactory::start_with_store(bad, Arc::clone(&store)).await,
        Err(CacheError::Config(_))
    ));

    // No nodes configured for Redis.
    assert!(matches!(
        CacheFactory::start(CacheConfig::default()).await,
        Err(CacheError::Config(_))
    ));

    let mut factory = CacheFactory::start_with_store(config(), store).await.unwrap();
    assert!(matches!(factory.cache(""), Err(CacheError::Config(_))));
    assert!(matches!(factory.cache("user:profile"), Err(CacheError::Config(_))));
    assert!(matches!(
        factory.cache_with_ttl("user:profile", Duration::from_secs(1)),
        Err(CacheError::Config(_))
    ));
    assert!(factory.cache("user_profile").is_ok());
    assert!(matches!(
        factory.cache_with_ttl("person", Duration::ZERO),
        Err(CacheError::Config(_))
    ));
    factory.stop().await;
}
