//! Integration tests for the tiered cache over the in-memory backend.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use stratum_core::MetricsRegistry;
use stratum_storage::{CacheConfig, InMemoryTier, TieredCache};

fn build(config: CacheConfig) -> (TieredCache<InMemoryTier>, Arc<MetricsRegistry>) {
    let registry = Arc::new(MetricsRegistry::new().unwrap());
    let cache = TieredCache::new(InMemoryTier::new(), config, registry.clone());
    (cache, registry)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_and_writers() {
    let (cache, _) = build(CacheConfig::default());
    let cache = Arc::new(cache);

    let mut handles = Vec::new();
    for task in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                let key = format!("task:{}:{}", task, i);
                let value = format!("value-{}", i);
                cache.set(&key, &value, Duration::from_secs(60)).await.unwrap();
                assert_eq!(cache.get(&key).await.unwrap(), value);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let metrics = cache.metrics();
    assert_eq!(metrics.sets, 400);
    assert_eq!(metrics.hits, 400);
    assert_eq!(metrics.misses, 0);
    // Every get landed on the entry the same task just wrote locally.
    assert_eq!(metrics.local_hits, 400);

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_eviction_loop_drains_expired_entries() {
    let config = CacheConfig {
        local_cache_ttl: Duration::from_millis(10),
        eviction_interval: Duration::from_millis(50),
        ..CacheConfig::default()
    };
    let (cache, _) = build(config);

    for i in 0..20 {
        cache
            .set(&format!("short:{}", i), "v", Duration::from_secs(60))
            .await
            .unwrap();
    }
    assert_eq!(cache.local_len(), 20);

    // Two sweep intervals after the TTL elapsed.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.local_len(), 0);

    // The remote tier is unaffected; reads fall through and back-fill.
    assert_eq!(cache.get("short:0").await.unwrap(), "v");
    assert_eq!(cache.local_len(), 1);

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_close_halts_background_loops() {
    let config = CacheConfig {
        local_cache_ttl: Duration::from_millis(10),
        eviction_interval: Duration::from_millis(30),
        ..CacheConfig::default()
    };
    let (cache, registry) = build(config);

    cache.close().await.unwrap();

    // The in-memory backend keeps accepting writes after close, so the
    // local tier fills back up.
    for i in 0..5 {
        cache
            .set(&format!("stale:{}", i), "v", Duration::ZERO)
            .await
            .unwrap();
    }
    assert_eq!(cache.local_len(), 5);

    // The entries expire well within this window, spanning several
    // eviction intervals. With the loops halted nothing sweeps them out;
    // only a read would remove them lazily.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(cache.local_len(), 5);

    // The metrics loop wrote no tier-size gauge either.
    let text = registry.encode_text().unwrap();
    assert!(!text.contains("cache_entries"));
}

#[tokio::test]
async fn test_registry_reflects_cache_traffic() {
    let (cache, registry) = build(CacheConfig::default());

    cache.set("user:1", "alice", Duration::ZERO).await.unwrap();
    cache.get("user:1").await.unwrap();
    let _ = cache.get("user:2").await;

    let text = registry.encode_text().unwrap();
    assert!(text.contains("cache_hits_total"));
    assert!(text.contains("cache_misses_total"));
    assert!(text.contains("user:*"));
    assert!(text.contains("cache_operation_duration_seconds"));

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_set_overwrites_both_tiers() {
    let (cache, _) = build(CacheConfig::default());

    cache.set("k", "old", Duration::ZERO).await.unwrap();
    cache.set("k", "new", Duration::ZERO).await.unwrap();

    // Local tier serves the overwritten value.
    assert_eq!(cache.get("k").await.unwrap(), "new");

    // So does the remote tier once the local entry is gone.
    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_json_values_survive_tier_fallthrough() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Session {
        user_id: u64,
        token: String,
    }

    let config = CacheConfig {
        // Remote-only, so every read exercises decode on the fallthrough
        // path.
        local_cache_enabled: false,
        ..CacheConfig::default()
    };
    let (cache, _) = build(config);

    let session = Session {
        user_id: 99,
        token: "abc123".to_string(),
    };
    cache
        .set_json("session:99", &session, Duration::from_secs(30))
        .await
        .unwrap();

    let loaded: Session = cache.get_json("session:99").await.unwrap();
    assert_eq!(loaded, session);

    cache.delete("session:99").await.unwrap();
    let err = cache.get_json::<Session>("session:99").await.unwrap_err();
    assert!(err.is_cache_miss());

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_get_multi_mixed_hits_and_misses() {
    let (cache, _) = build(CacheConfig::default());

    cache.set("order:1", "a", Duration::ZERO).await.unwrap();
    cache.set("order:3", "c", Duration::ZERO).await.unwrap();

    let keys: Vec<String> = (1..=4).map(|i| format!("order:{}", i)).collect();
    let found = cache.get_multi(&keys).await.unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(found.get("order:1"), Some(&"a".to_string()));
    assert_eq!(found.get("order:3"), Some(&"c".to_string()));
    assert!(!found.contains_key("order:2"));

    // Absent keys in a batch are plain absences, never an error.
    let none = cache
        .get_multi(&["order:7".to_string()])
        .await
        .unwrap();
    assert!(none.is_empty());

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_get_multi_empty_key_list() {
    let (cache, _) = build(CacheConfig::default());
    let found = cache.get_multi(&[]).await.unwrap();
    assert!(found.is_empty());
    cache.close().await.unwrap();
}
