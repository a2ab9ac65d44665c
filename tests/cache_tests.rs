//! LRU cache and response cache integration tests

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use boxd_export::cache::{EstimateSize, LruCache, ResponseCache, spawn_cleanup};
use boxd_export::config::CacheConfig;
use boxd_export::metrics::Metrics;

#[test]
fn test_recently_read_entry_survives_eviction() {
    let cache: LruCache<String> = LruCache::new(3, 0, Duration::from_secs(60));
    cache.set("films/1", "Stalker".into());
    cache.set("films/2", "Solaris".into());
    cache.set("films/3", "Mirror".into());

    // Reading films/1 makes films/2 the eviction candidate
    assert_eq!(cache.get("films/1").as_deref(), Some("Stalker"));
    cache.set("films/4", "Nostalghia".into());

    assert!(cache.contains("films/1"));
    assert!(!cache.contains("films/2"));
    assert_eq!(cache.keys(), vec!["films/4", "films/1", "films/3"]);
}

#[test]
fn test_peek_does_not_promote() {
    let cache: LruCache<String> = LruCache::new(2, 0, Duration::from_secs(60));
    cache.set("a", "1".into());
    cache.set("b", "2".into());

    assert_eq!(cache.peek("a").as_deref(), Some("1"));
    cache.set("c", "3".into());

    assert!(!cache.contains("a"));
    assert_eq!(cache.stats().hits, 0);
}

#[test]
fn test_memory_never_exceeds_budget() {
    let budget = 512;
    let cache: LruCache<Value> = LruCache::new(1_000, budget, Duration::from_secs(60));

    for i in 0..200 {
        let value = json!({ "id": i, "title": "x".repeat(i % 40) });
        cache.set(&format!("diary/{i}"), value);
        let stats = cache.stats();
        assert!(
            stats.memory_bytes <= budget,
            "memory {} exceeds budget {budget} after insert {i}",
            stats.memory_bytes
        );
    }

    let stats = cache.stats();
    assert!(stats.memory_evictions > 0);
    assert_eq!(stats.capacity_evictions, 0);
}

#[test]
fn test_memory_accounting_matches_entries() {
    let cache: LruCache<Value> = LruCache::new(10, 0, Duration::from_secs(60));
    let first = json!({ "title": "Heat" });
    let second = json!(["a", "bb"]);
    cache.set("k1", first.clone());
    cache.set("k2", second.clone());

    let expected = 2 + first.estimated_size() + 2 + second.estimated_size();
    assert_eq!(cache.stats().memory_bytes, expected);

    cache.delete("k1");
    assert_eq!(cache.stats().memory_bytes, 2 + second.estimated_size());
}

#[test]
fn test_per_entry_ttl() {
    let cache: LruCache<u64> = LruCache::new(10, 0, Duration::from_secs(60));
    cache.set_with_ttl("short", 1, Duration::from_millis(5));
    cache.set("long", 2);

    std::thread::sleep(Duration::from_millis(20));

    assert_eq!(cache.get("short"), None);
    assert_eq!(cache.get("long"), Some(2));
    let stats = cache.stats();
    assert_eq!(stats.expirations, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[test]
fn test_concurrent_readers_and_writers() {
    let cache: Arc<LruCache<u64>> = Arc::new(LruCache::new(64, 0, Duration::from_secs(60)));

    std::thread::scope(|scope| {
        for t in 0..8u64 {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                for i in 0..500u64 {
                    let key = format!("k{}", (t * 31 + i) % 100);
                    if i % 3 == 0 {
                        cache.set(&key, i);
                    } else {
                        let _ = cache.get(&key);
                    }
                }
            });
        }
    });

    let stats = cache.stats();
    assert!(stats.entries <= 64);
    assert_eq!(cache.keys().len(), stats.entries);
    assert_eq!(stats.hits + stats.misses, 8 * 500 - stats.sets);
}

#[tokio::test]
async fn test_background_cleanup_sweeps_expired() {
    let cache: Arc<LruCache<String>> =
        Arc::new(LruCache::new(10, 0, Duration::from_millis(5)));
    cache.set("a", "1".into());
    cache.set("b", "2".into());
    cache.set_with_ttl("c", "3".into(), Duration::from_secs(60));

    let token = CancellationToken::new();
    let handle = spawn_cleanup(Arc::clone(&cache), Duration::from_millis(10), token.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.keys(), vec!["c"]);
    assert_eq!(cache.stats().expirations, 2);

    token.cancel();
    handle.await.unwrap();
}

#[test]
fn test_cache_reports_to_metrics() {
    let metrics = Arc::new(Metrics::new());
    let cache: LruCache<String> =
        LruCache::new(4, 0, Duration::from_secs(60)).with_metrics(Arc::clone(&metrics));

    cache.set("a", "1".into());
    cache.get("a");
    cache.get("a");
    cache.get("missing");

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.cache_hits, 2);
    assert_eq!(snapshot.cache_misses, 1);
    assert!((snapshot.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn test_response_cache_with_built_keys() {
    let cache = ResponseCache::new(&CacheConfig {
        capacity: 2,
        ..CacheConfig::default()
    });

    let page = |n: u64| ResponseCache::build_key("films", "list", &json!({ "page": n }));
    cache.set(&page(1), &json!({ "results": ["Alien"] })).unwrap();
    cache.set(&page(2), &json!({ "results": ["Aliens"] })).unwrap();
    cache.set(&page(3), &json!({ "results": ["Alien 3"] })).unwrap();

    assert_eq!(cache.get::<Value>(&page(1)), None);
    assert_eq!(
        cache.get::<Value>(&page(3)),
        Some(json!({ "results": ["Alien 3"] }))
    );
    assert_eq!(cache.stats().capacity_evictions, 1);
}
