// Cross-level cache behavior: round trips, eviction, TTL, persistence
// across restart, corruption handling, and path confinement.

use rusty_fs::cache::{
    CacheConfig, CachePlacement, EvictionPolicy, PersistentCacheConfig, PutOrigin, TieredCache,
};
use std::time::Duration;
use tempfile::TempDir;

fn l1_config(max_entries: usize) -> CacheConfig {
    CacheConfig {
        max_entries,
        ..Default::default()
    }
}

fn two_tier_config(dir: &TempDir, placement: CachePlacement) -> CacheConfig {
    CacheConfig {
        placement,
        l2: Some(PersistentCacheConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn basic_put_get_with_stats() {
    let cache = TieredCache::new(CacheConfig::default()).unwrap();
    cache.put("a", 0, b"hello", PutOrigin::User).unwrap();
    assert_eq!(cache.get("a", 0, 5).unwrap(), b"hello");

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
    assert!(stats.hit_rate > 0.99);
}

#[test]
fn returned_payload_is_isolated() {
    let cache = TieredCache::new(CacheConfig::default()).unwrap();
    cache.put("a", 0, b"abc", PutOrigin::User).unwrap();
    let mut copy = cache.get("a", 0, 3).unwrap();
    copy[0] = b'z';
    assert_eq!(cache.get("a", 0, 3).unwrap(), b"abc");
}

#[test]
fn lru_eviction_at_entry_cap() {
    let cache = TieredCache::new(l1_config(3)).unwrap();
    cache.put("k", 0, b"d1", PutOrigin::User).unwrap();
    cache.put("k", 1, b"d2", PutOrigin::User).unwrap();
    cache.put("k", 2, b"d3", PutOrigin::User).unwrap();
    cache.put("k", 3, b"d4", PutOrigin::User).unwrap();

    // The entry inserted first is gone, the other three remain.
    assert!(cache.get("k", 0, 2).is_none());
    assert!(cache.get("k", 1, 2).is_some());
    assert!(cache.get("k", 2, 2).is_some());
    assert!(cache.get("k", 3, 2).is_some());
}

#[test]
fn ttl_expiry_reports_miss() {
    let cache = TieredCache::new(CacheConfig {
        ttl: Duration::from_millis(100),
        ..Default::default()
    })
    .unwrap();
    cache.put("x", 0, b"x", PutOrigin::User).unwrap();
    std::thread::sleep(Duration::from_millis(150));
    assert!(cache.get("x", 0, 1).is_none());
    assert!(cache.stats().misses >= 1);
}

#[test]
fn capacity_invariant_holds_after_any_put_sequence() {
    let cache = TieredCache::new(CacheConfig {
        capacity_bytes: 1024,
        max_entries: 16,
        ..Default::default()
    })
    .unwrap();
    for i in 0..64u64 {
        let payload = vec![i as u8; 100];
        cache.put("obj", i * 100, &payload, PutOrigin::User).unwrap();
        let stats = cache.stats();
        let l1 = &stats.levels[0];
        assert!(l1.size <= l1.capacity);
        assert!(l1.entries <= 16);
    }
}

#[test]
fn inclusive_placement_mirrors_puts_to_l2() {
    let dir = TempDir::new().unwrap();
    let cache = TieredCache::new(two_tier_config(&dir, CachePlacement::Inclusive)).unwrap();
    cache.put("k", 0, b"payload", PutOrigin::User).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.levels[1].entries, 1);
}

#[test]
fn exclusive_placement_keeps_l2_empty_until_eviction() {
    let dir = TempDir::new().unwrap();
    let cache = TieredCache::new(two_tier_config(&dir, CachePlacement::Exclusive)).unwrap();
    cache.put("k", 0, b"payload", PutOrigin::User).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.levels[1].entries, 0);
}

#[test]
fn l2_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let cache = TieredCache::new(two_tier_config(&dir, CachePlacement::Inclusive)).unwrap();
        cache.put("p", 0, b"v1", PutOrigin::User).unwrap();
        cache.put("q", 100, b"v2", PutOrigin::User).unwrap();
        cache.optimize().unwrap();
    }

    let cache = TieredCache::new(two_tier_config(&dir, CachePlacement::Inclusive)).unwrap();
    assert_eq!(cache.get("p", 0, 2).unwrap(), b"v1");
    assert_eq!(cache.get("q", 100, 2).unwrap(), b"v2");
}

#[test]
fn corrupted_entry_file_never_serves_wrong_bytes() {
    let dir = TempDir::new().unwrap();
    {
        let cache = TieredCache::new(two_tier_config(&dir, CachePlacement::Inclusive)).unwrap();
        cache.put("p", 0, b"v1", PutOrigin::User).unwrap();
        cache.optimize().unwrap();
    }

    // Overwrite every entry file with garbage.
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().map(|e| e == "cache").unwrap_or(false) {
            std::fs::write(&path, b"corrupted").unwrap();
        }
    }

    let cache = TieredCache::new(two_tier_config(&dir, CachePlacement::Inclusive)).unwrap();
    // L1 is cold after restart, so this consults L2, which must drop the
    // corrupt entry and report a miss rather than returning garbage.
    assert!(cache.get("p", 0, 2).is_none());
}

#[test]
fn index_path_traversal_refused() {
    let dir = TempDir::new().unwrap();
    let result = TieredCache::new(CacheConfig {
        l2: Some(PersistentCacheConfig {
            directory: dir.path().to_path_buf(),
            index_file: "../../../etc/passwd".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    assert!(result.is_err());
    // Nothing was created outside the cache directory, which is empty.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn delete_purges_every_level_and_only_that_key() {
    let dir = TempDir::new().unwrap();
    let cache = TieredCache::new(two_tier_config(&dir, CachePlacement::Inclusive)).unwrap();
    cache.put("ab", 0, b"1", PutOrigin::User).unwrap();
    cache.put("abc", 0, b"22", PutOrigin::User).unwrap();

    cache.delete("ab");
    assert!(cache.get("ab", 0, 1).is_none());
    assert_eq!(cache.get("abc", 0, 2).unwrap(), b"22");
}

#[test]
fn weighted_lru_keeps_hot_entries() {
    let cache = TieredCache::new(CacheConfig {
        capacity_bytes: 600,
        eviction_policy: EvictionPolicy::WeightedLru,
        ..Default::default()
    })
    .unwrap();

    cache.put("hot", 0, &[1u8; 64], PutOrigin::User).unwrap();
    for _ in 0..10 {
        cache.get("hot", 0, 64);
    }
    cache.put("cold", 0, &[2u8; 400], PutOrigin::User).unwrap();
    // This insert pushes past capacity; the cold bulky entry should go.
    cache.put("warm", 0, &[3u8; 200], PutOrigin::User).unwrap();

    assert!(cache.get("hot", 0, 64).is_some());
    assert!(cache.get("cold", 0, 400).is_none());
}

#[test]
fn hit_rate_fields_stay_in_unit_interval() {
    let cache = TieredCache::new(CacheConfig::default()).unwrap();
    cache.put("k", 0, b"v", PutOrigin::User).unwrap();
    cache.get("k", 0, 1);
    cache.get("absent", 0, 1);

    let stats = cache.stats();
    assert!((0.0..=1.0).contains(&stats.hit_rate));
    assert!((0.0..=1.0).contains(&stats.utilization));
    assert!((0.0..=1.0).contains(&stats.efficiency));
    for level in &stats.levels {
        assert!((0.0..=1.0).contains(&level.hit_rate));
        assert!((0.0..=1.0).contains(&level.utilization));
    }
}

#[tokio::test]
async fn close_is_clean_with_l2() {
    let dir = TempDir::new().unwrap();
    let cache = TieredCache::new(two_tier_config(&dir, CachePlacement::Inclusive)).unwrap();
    cache.put("k", 0, b"v", PutOrigin::User).unwrap();
    cache.close().await.unwrap();
    assert!(dir.path().join("cache-index.json").exists());
}
