// # Tiered Cache Chain
//
// L1 in memory, optional L2 on disk, consulted in order. A hit at L2
// promotes the payload into L1 before returning. Placement of writes
// follows the configured policy; under exclusive placement, L1 evictions
// spill into L2. Every user-facing `get` and `put` is reported to the
// prefetcher over a bounded queue; a full queue drops the event rather
// than stalling the read path.

use super::memory::MemoryCache;
use super::persistent::PersistentCache;
use super::statistics::{ChainStats, LevelStats};
use super::{
    CacheConfig, CacheHit, CacheLevel, CachePlacement, PutOrigin, HYBRID_HOT_ACCESS_COUNT,
};
use crate::common::{AccessEvent, RangeFingerprint};
use crate::error::Result;
use crate::metrics::MetricsRecorder;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of the access-event queue feeding the prefetcher.
pub const ACCESS_EVENT_QUEUE_DEPTH: usize = 1024;

/// The read-cache chain.
pub struct TieredCache {
    l1: Arc<MemoryCache>,
    l2: Option<Arc<PersistentCache>>,
    l2_enabled: AtomicBool,
    placement: CachePlacement,
    hybrid_size_threshold: u64,
    chain_hits: AtomicU64,
    chain_misses: AtomicU64,
    prefetch_hits: AtomicU64,
    access_tx: Mutex<Option<mpsc::Sender<AccessEvent>>>,
    metrics: Mutex<Option<Arc<dyn MetricsRecorder>>>,
}

impl TieredCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let l1 = Arc::new(MemoryCache::new(
            config.capacity_bytes,
            config.max_entries,
            config.ttl,
            config.eviction_policy,
        ));
        let l2 = match config.l2 {
            Some(l2_config) => Some(PersistentCache::new(l2_config)?),
            None => None,
        };
        Ok(Self {
            l1,
            l2,
            l2_enabled: AtomicBool::new(true),
            placement: config.placement,
            hybrid_size_threshold: config.hybrid_size_threshold,
            chain_hits: AtomicU64::new(0),
            chain_misses: AtomicU64::new(0),
            prefetch_hits: AtomicU64::new(0),
            access_tx: Mutex::new(None),
            metrics: Mutex::new(None),
        })
    }

    /// Wires the metrics collaborator.
    pub fn set_metrics(&self, recorder: Arc<dyn MetricsRecorder>) {
        *self.metrics.lock() = Some(recorder);
    }

    /// Opens the bounded access-event queue consumed by the prefetcher.
    /// Only one subscriber is supported; a second call replaces the first.
    pub fn subscribe_access_events(&self) -> mpsc::Receiver<AccessEvent> {
        let (tx, rx) = mpsc::channel(ACCESS_EVENT_QUEUE_DEPTH);
        *self.access_tx.lock() = Some(tx);
        rx
    }

    /// Exact-fingerprint lookup across the chain.
    pub fn get(&self, key: &str, offset: u64, length: u64) -> Option<Vec<u8>> {
        let fingerprint = RangeFingerprint::new(key, offset, length);

        if let Some(hit) = self.l1.get(&fingerprint) {
            self.record_hit(&hit, self.l1.name());
            self.emit(AccessEvent::new(key, offset, length)
                .with_hit(true)
                .with_prefetch_origin(hit.prefetch_origin));
            return Some(hit.data);
        }

        if let Some(l2) = self.enabled_l2() {
            if let Some(hit) = l2.get(&fingerprint) {
                // Promote into the faster level before returning.
                let level = l2.name();
                let _ = self.l1.put(&fingerprint, &hit.data, PutOrigin::User);
                self.record_hit(&hit, level);
                self.emit(AccessEvent::new(key, offset, length)
                    .with_hit(true)
                    .with_prefetch_origin(hit.prefetch_origin));
                return Some(hit.data);
            }
        }

        self.chain_misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = self.metrics.lock().as_ref() {
            metrics.record_cache_miss();
        }
        self.emit(AccessEvent::new(key, offset, length).with_hit(false));
        None
    }

    /// Inserts a payload. The fingerprint is `(key, offset, len(data))`.
    pub fn put(&self, key: &str, offset: u64, data: &[u8], origin: PutOrigin) -> Result<()> {
        let fingerprint = RangeFingerprint::new(key, offset, data.len() as u64);

        match self.placement {
            CachePlacement::Inclusive => {
                self.l1.put(&fingerprint, data, origin)?;
                if let Some(l2) = self.enabled_l2() {
                    l2.put(&fingerprint, data, origin)?;
                }
            }
            CachePlacement::Exclusive => {
                let evicted = self.l1.put_returning_evicted(&fingerprint, data, origin);
                if let Some(l2) = self.enabled_l2() {
                    for entry in evicted {
                        let spill_origin = if entry.prefetched {
                            PutOrigin::Prefetch
                        } else {
                            PutOrigin::User
                        };
                        l2.put(&entry.fingerprint, &entry.data, spill_origin)?;
                    }
                }
            }
            CachePlacement::Hybrid => {
                let hot = self.l1.access_count(&fingerprint) >= HYBRID_HOT_ACCESS_COUNT;
                self.l1.put(&fingerprint, data, origin)?;
                let large = data.len() as u64 >= self.hybrid_size_threshold;
                if large || hot {
                    if let Some(l2) = self.enabled_l2() {
                        l2.put(&fingerprint, data, origin)?;
                    }
                }
            }
        }

        self.emit(
            AccessEvent::new(key, offset, data.len() as u64)
                .with_prefetch_origin(origin == PutOrigin::Prefetch),
        );
        Ok(())
    }

    /// Removes every cached range of `key` from every enabled level.
    pub fn delete(&self, key: &str) -> usize {
        let mut removed = self.l1.delete(key);
        if let Some(l2) = self.enabled_l2() {
            removed += l2.delete(key);
        }
        removed
    }

    /// Removes entries overlapping `[offset, offset + length)` of `key`
    /// from every enabled level. Used by the write buffer after a flush.
    pub fn invalidate_range(&self, key: &str, offset: u64, length: u64) -> usize {
        let mut removed = self.l1.invalidate_range(key, offset, length);
        if let Some(l2) = self.enabled_l2() {
            removed += l2.invalidate_range(key, offset, length);
        }
        if removed > 0 {
            debug!(key, offset, length, removed, "invalidated overlapping cache entries");
        }
        removed
    }

    /// Frees at least `target_bytes` from L1, spilling under exclusive
    /// placement.
    pub fn evict(&self, target_bytes: u64) -> bool {
        let (reached, evicted) = self.l1.evict_returning(target_bytes);
        if self.placement == CachePlacement::Exclusive {
            if let Some(l2) = self.enabled_l2() {
                for entry in evicted {
                    let origin = if entry.prefetched {
                        PutOrigin::Prefetch
                    } else {
                        PutOrigin::User
                    };
                    let _ = l2.put(&entry.fingerprint, &entry.data, origin);
                }
            }
        }
        reached
    }

    /// Whether the fingerprint is present at any enabled level.
    pub fn contains(&self, fingerprint: &RangeFingerprint) -> bool {
        if self.l1.contains(fingerprint) {
            return true;
        }
        self.enabled_l2().map_or(false, |l2| l2.contains(fingerprint))
    }

    /// Toggles the disk level. Disabling leaves its contents intact;
    /// re-enabling restores access without repopulation.
    pub fn set_l2_enabled(&self, enabled: bool) {
        self.l2_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Runs L2 maintenance (TTL sweep, eviction, index save) synchronously.
    pub fn optimize(&self) -> Result<()> {
        if let Some(l2) = &self.l2 {
            l2.optimize()?;
        }
        Ok(())
    }

    /// Shuts down background maintenance and saves the L2 index.
    pub async fn close(&self) -> Result<()> {
        if let Some(l2) = &self.l2 {
            l2.close().await?;
        }
        Ok(())
    }

    pub fn stats(&self) -> ChainStats {
        let mut levels: Vec<LevelStats> = vec![self.l1.stats()];
        if let Some(l2) = &self.l2 {
            levels.push(l2.stats());
        }
        ChainStats::aggregate(
            levels,
            self.chain_hits.load(Ordering::Relaxed),
            self.chain_misses.load(Ordering::Relaxed),
        )
    }

    /// Reads that hit an entry the prefetcher inserted.
    pub fn prefetch_hits(&self) -> u64 {
        self.prefetch_hits.load(Ordering::Relaxed)
    }

    /// Prefetched entries evicted without ever being read.
    pub fn prefetch_waste(&self) -> u64 {
        self.l1.prefetch_waste()
    }

    fn enabled_l2(&self) -> Option<&Arc<PersistentCache>> {
        if self.l2_enabled.load(Ordering::SeqCst) {
            self.l2.as_ref()
        } else {
            None
        }
    }

    fn record_hit(&self, hit: &CacheHit, level: &str) {
        self.chain_hits.fetch_add(1, Ordering::Relaxed);
        if hit.prefetch_origin {
            self.prefetch_hits.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(metrics) = self.metrics.lock().as_ref() {
            metrics.record_cache_hit(level);
        }
    }

    fn emit(&self, event: AccessEvent) {
        if let Some(tx) = self.access_tx.lock().as_ref() {
            // Full queue: drop the event, never block a read.
            let _ = tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PersistentCacheConfig;
    use tempfile::TempDir;

    fn l1_only() -> TieredCache {
        TieredCache::new(CacheConfig::default()).unwrap()
    }

    fn with_l2(dir: &TempDir, placement: CachePlacement) -> TieredCache {
        TieredCache::new(CacheConfig {
            placement,
            l2: Some(PersistentCacheConfig {
                directory: dir.path().to_path_buf(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap()
    }

    fn fp(key: &str, offset: u64, len: u64) -> RangeFingerprint {
        RangeFingerprint::new(key, offset, len)
    }

    #[test]
    fn test_basic_put_get() {
        let cache = l1_only();
        cache.put("a", 0, b"hello", PutOrigin::User).unwrap();
        assert_eq!(cache.get("a", 0, 5).unwrap(), b"hello");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_inclusive_writes_both_levels() {
        let dir = TempDir::new().unwrap();
        let cache = with_l2(&dir, CachePlacement::Inclusive);
        cache.put("k", 0, b"data", PutOrigin::User).unwrap();
        let f = fp("k", 0, 4);
        assert!(cache.l1.contains(&f));
        assert!(cache.l2.as_ref().unwrap().contains(&f));
    }

    #[test]
    fn test_exclusive_writes_l1_only() {
        let dir = TempDir::new().unwrap();
        let cache = with_l2(&dir, CachePlacement::Exclusive);
        cache.put("k", 0, b"data", PutOrigin::User).unwrap();
        let f = fp("k", 0, 4);
        assert!(cache.l1.contains(&f));
        assert!(!cache.l2.as_ref().unwrap().contains(&f));
    }

    #[test]
    fn test_exclusive_spills_evictions_to_l2() {
        let dir = TempDir::new().unwrap();
        let cache = TieredCache::new(CacheConfig {
            max_entries: 1,
            placement: CachePlacement::Exclusive,
            l2: Some(PersistentCacheConfig {
                directory: dir.path().to_path_buf(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();
        cache.put("a", 0, b"first", PutOrigin::User).unwrap();
        cache.put("b", 0, b"second", PutOrigin::User).unwrap();
        // "a" was evicted from L1 into L2; a get promotes it back.
        assert!(cache.l2.as_ref().unwrap().contains(&fp("a", 0, 5)));
        assert_eq!(cache.get("a", 0, 5).unwrap(), b"first");
        assert!(cache.l1.contains(&fp("a", 0, 5)));
    }

    #[test]
    fn test_hybrid_promotes_large_payloads() {
        let dir = TempDir::new().unwrap();
        let cache = TieredCache::new(CacheConfig {
            placement: CachePlacement::Hybrid,
            hybrid_size_threshold: 1024,
            l2: Some(PersistentCacheConfig {
                directory: dir.path().to_path_buf(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();
        cache.put("small", 0, b"tiny", PutOrigin::User).unwrap();
        let big = vec![0u8; 2048];
        cache.put("big", 0, &big, PutOrigin::User).unwrap();
        let l2 = cache.l2.as_ref().unwrap();
        assert!(!l2.contains(&fp("small", 0, 4)));
        assert!(l2.contains(&fp("big", 0, 2048)));
    }

    #[test]
    fn test_l2_hit_promotes_to_l1() {
        let dir = TempDir::new().unwrap();
        let cache = with_l2(&dir, CachePlacement::Inclusive);
        cache.put("k", 0, b"data", PutOrigin::User).unwrap();
        let f = fp("k", 0, 4);
        cache.l1.delete("k");
        assert!(!cache.l1.contains(&f));
        assert_eq!(cache.get("k", 0, 4).unwrap(), b"data");
        assert!(cache.l1.contains(&f));
    }

    #[test]
    fn test_delete_purges_all_levels() {
        let dir = TempDir::new().unwrap();
        let cache = with_l2(&dir, CachePlacement::Inclusive);
        cache.put("k", 0, b"data", PutOrigin::User).unwrap();
        assert_eq!(cache.delete("k"), 2);
        assert!(cache.get("k", 0, 4).is_none());
    }

    #[test]
    fn test_disable_l2_preserves_contents() {
        let dir = TempDir::new().unwrap();
        let cache = with_l2(&dir, CachePlacement::Inclusive);
        cache.put("k", 0, b"data", PutOrigin::User).unwrap();
        cache.l1.delete("k");

        cache.set_l2_enabled(false);
        assert!(cache.get("k", 0, 4).is_none());

        cache.set_l2_enabled(true);
        assert_eq!(cache.get("k", 0, 4).unwrap(), b"data");
    }

    #[test]
    fn test_access_events_emitted() {
        let cache = l1_only();
        let mut rx = cache.subscribe_access_events();
        cache.put("k", 0, b"data", PutOrigin::User).unwrap();
        cache.get("k", 0, 4);
        cache.get("k", 100, 4);

        let put_event = rx.try_recv().unwrap();
        assert_eq!(put_event.key, "k");
        let hit_event = rx.try_recv().unwrap();
        assert!(hit_event.was_hit);
        let miss_event = rx.try_recv().unwrap();
        assert!(!miss_event.was_hit);
        assert_eq!(miss_event.offset, 100);
    }

    #[test]
    fn test_prefetch_put_emits_tagged_event() {
        let cache = l1_only();
        let mut rx = cache.subscribe_access_events();
        cache.put("k", 0, b"ahead", PutOrigin::Prefetch).unwrap();

        let event = rx.try_recv().unwrap();
        assert!(event.was_prefetch_origin);
        assert!(!event.was_hit);
    }

    #[test]
    fn test_prefetch_hit_counted_once() {
        let cache = l1_only();
        cache.put("k", 0, b"data", PutOrigin::Prefetch).unwrap();
        cache.get("k", 0, 4);
        cache.get("k", 0, 4);
        assert_eq!(cache.prefetch_hits(), 1);
    }

    #[test]
    fn test_metrics_recorder_sees_hits_and_misses() {
        use std::sync::atomic::AtomicU64;

        #[derive(Default)]
        struct Counting {
            hits: AtomicU64,
            misses: AtomicU64,
        }
        impl MetricsRecorder for Counting {
            fn record_operation(&self, _: &'static str, _: std::time::Duration) {}
            fn record_cache_hit(&self, _level: &str) {
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            fn record_cache_miss(&self) {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
            fn record_error(&self, _: &'static str) {}
        }

        let cache = l1_only();
        let recorder = Arc::new(Counting::default());
        cache.set_metrics(Arc::clone(&recorder) as Arc<dyn MetricsRecorder>);

        cache.put("k", 0, b"v", PutOrigin::User).unwrap();
        cache.get("k", 0, 1);
        cache.get("absent", 0, 1);

        assert_eq!(recorder.hits.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_invalidate_range_across_levels() {
        let dir = TempDir::new().unwrap();
        let cache = with_l2(&dir, CachePlacement::Inclusive);
        cache.put("k", 0, b"0123456789", PutOrigin::User).unwrap();
        cache.put("k", 100, b"far", PutOrigin::User).unwrap();
        assert_eq!(cache.invalidate_range("k", 5, 10), 2);
        assert!(cache.get("k", 0, 10).is_none());
        assert!(cache.get("k", 100, 3).is_some());
    }
}
