// # In-Memory Cache Level (L1)
//
// Fingerprint-keyed LRU over owned payloads. One read-write lock guards
// the map, the recency list, and byte accounting; `get` takes the write
// lock because it mutates recency and counters. Hit/miss/eviction totals
// live in atomics outside the lock.

use super::statistics::LevelStats;
use super::{CacheHit, CacheLevel, EvictionPolicy, PutOrigin};
use crate::common::RangeFingerprint;
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// One cached range.
struct Entry {
    fingerprint: RangeFingerprint,
    data: Vec<u8>,
    inserted_at: Instant,
    last_access: Instant,
    access_count: u64,
    prefetched: bool,
}

impl Entry {
    fn is_expired(&self, ttl: Duration) -> bool {
        !ttl.is_zero() && self.inserted_at.elapsed() > ttl
    }

    /// Eviction weight for the `weighted_lru` policy: recency x frequency
    /// scaled down by payload size. Lower weight evicts first.
    fn weight(&self) -> f64 {
        let hours = self.last_access.elapsed().as_secs_f64() / 3600.0;
        let recency = 1.0 / (1.0 + hours);
        let frequency = (self.access_count as f64).max(1.0);
        let size_penalty = (self.data.len() as f64).max(1.0);
        recency * frequency / size_penalty
    }
}

/// An entry removed to make room, handed back so the chain can spill it
/// to a slower level under exclusive placement.
pub struct EvictedEntry {
    pub fingerprint: RangeFingerprint,
    pub data: Vec<u8>,
    pub prefetched: bool,
}

struct Inner {
    /// cache_key -> entry.
    map: HashMap<String, Entry>,
    /// Recency list, most recent at the front.
    recency: VecDeque<String>,
    current_bytes: u64,
}

/// In-memory cache level.
pub struct MemoryCache {
    inner: RwLock<Inner>,
    capacity_bytes: u64,
    max_entries: usize,
    ttl: Duration,
    policy: EvictionPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    /// Prefetched entries evicted without ever being read.
    prefetch_waste: AtomicU64,
}

impl MemoryCache {
    pub fn new(
        capacity_bytes: u64,
        max_entries: usize,
        ttl: Duration,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                recency: VecDeque::new(),
                current_bytes: 0,
            }),
            capacity_bytes,
            max_entries,
            ttl,
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            prefetch_waste: AtomicU64::new(0),
        }
    }

    /// Insert and hand back whatever was evicted to make room.
    pub fn put_returning_evicted(
        &self,
        fingerprint: &RangeFingerprint,
        data: &[u8],
        origin: PutOrigin,
    ) -> Vec<EvictedEntry> {
        let cache_key = fingerprint.cache_key();
        let mut inner = self.inner.write();

        if let Some(entry) = inner.map.get_mut(&cache_key) {
            // A live user-origin payload is newer than any speculative
            // fetch racing it; the prefetch result is discarded.
            if origin == PutOrigin::Prefetch && !entry.prefetched {
                return Vec::new();
            }
            entry.data.clear();
            entry.data.extend_from_slice(data);
            entry.inserted_at = Instant::now();
            entry.prefetched = origin == PutOrigin::Prefetch;
            Self::move_to_front(&mut inner.recency, &cache_key);
            return Vec::new();
        }

        let now = Instant::now();
        inner.map.insert(
            cache_key.clone(),
            Entry {
                fingerprint: fingerprint.clone(),
                data: data.to_vec(),
                inserted_at: now,
                last_access: now,
                access_count: 0,
                prefetched: origin == PutOrigin::Prefetch,
            },
        );
        inner.recency.push_front(cache_key);
        inner.current_bytes += data.len() as u64;

        let mut evicted = Vec::new();
        while inner.current_bytes > self.capacity_bytes || inner.map.len() > self.max_entries {
            match self.evict_one(&mut inner) {
                Some(e) => evicted.push(e),
                None => break,
            }
        }
        evicted
    }

    /// Free at least `target_bytes`, returning the removed entries.
    pub fn evict_returning(&self, target_bytes: u64) -> (bool, Vec<EvictedEntry>) {
        let mut inner = self.inner.write();
        let mut freed = 0u64;
        let mut evicted = Vec::new();
        while freed < target_bytes {
            match self.evict_one(&mut inner) {
                Some(e) => {
                    freed += e.data.len() as u64;
                    evicted.push(e);
                }
                None => break,
            }
        }
        (freed >= target_bytes, evicted)
    }

    fn evict_one(&self, inner: &mut Inner) -> Option<EvictedEntry> {
        let victim_key = match self.policy {
            EvictionPolicy::Lru => inner.recency.back().cloned()?,
            EvictionPolicy::WeightedLru => {
                // Lowest weight first; ties broken by older last-access.
                inner
                    .map
                    .iter()
                    .min_by(|(_, a), (_, b)| {
                        a.weight()
                            .partial_cmp(&b.weight())
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.last_access.cmp(&b.last_access))
                    })
                    .map(|(k, _)| k.clone())?
            }
        };

        let entry = inner.map.remove(&victim_key)?;
        inner.recency.retain(|k| k != &victim_key);
        inner.current_bytes -= entry.data.len() as u64;
        self.evictions.fetch_add(1, Ordering::Relaxed);
        if entry.prefetched && entry.access_count == 0 {
            self.prefetch_waste.fetch_add(1, Ordering::Relaxed);
        }
        debug!(fingerprint = %entry.fingerprint, "evicted from memory cache");
        Some(EvictedEntry {
            fingerprint: entry.fingerprint,
            data: entry.data,
            prefetched: entry.prefetched,
        })
    }

    fn move_to_front(recency: &mut VecDeque<String>, cache_key: &str) {
        recency.retain(|k| k != cache_key);
        recency.push_front(cache_key.to_string());
    }

    fn remove_entry(inner: &mut Inner, cache_key: &str) -> Option<Entry> {
        let entry = inner.map.remove(cache_key)?;
        inner.recency.retain(|k| k != cache_key);
        inner.current_bytes -= entry.data.len() as u64;
        Some(entry)
    }

    /// Prefetched entries evicted before any read.
    pub fn prefetch_waste(&self) -> u64 {
        self.prefetch_waste.load(Ordering::Relaxed)
    }

    /// Reads this fingerprint has served, without touching recency.
    pub fn access_count(&self, fingerprint: &RangeFingerprint) -> u64 {
        self.inner
            .read()
            .map
            .get(&fingerprint.cache_key())
            .map(|e| e.access_count)
            .unwrap_or(0)
    }
}

impl CacheLevel for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, fingerprint: &RangeFingerprint) -> Option<CacheHit> {
        let cache_key = fingerprint.cache_key();
        let mut inner = self.inner.write();

        let expired = match inner.map.get(&cache_key) {
            Some(entry) => entry.is_expired(self.ttl),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            Self::remove_entry(&mut inner, &cache_key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        Self::move_to_front(&mut inner.recency, &cache_key);
        let entry = inner.map.get_mut(&cache_key).expect("entry present");
        entry.last_access = Instant::now();
        entry.access_count += 1;
        // The tag is consumed by the first read so prefetch hits are
        // counted exactly once per speculative fill.
        let prefetch_origin = entry.prefetched;
        entry.prefetched = false;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheHit {
            data: entry.data.clone(),
            prefetch_origin,
        })
    }

    fn put(&self, fingerprint: &RangeFingerprint, data: &[u8], origin: PutOrigin) -> Result<()> {
        self.put_returning_evicted(fingerprint, data, origin);
        Ok(())
    }

    fn delete(&self, key: &str) -> usize {
        let prefix = RangeFingerprint::key_prefix(key);
        let mut inner = self.inner.write();
        let victims: Vec<String> = inner
            .map
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for cache_key in &victims {
            Self::remove_entry(&mut inner, cache_key);
        }
        victims.len()
    }

    fn invalidate_range(&self, key: &str, offset: u64, length: u64) -> usize {
        let mut inner = self.inner.write();
        let victims: Vec<String> = inner
            .map
            .values()
            .filter(|e| e.fingerprint.key == key && e.fingerprint.overlaps(offset, length))
            .map(|e| e.fingerprint.cache_key())
            .collect();
        for cache_key in &victims {
            Self::remove_entry(&mut inner, cache_key);
        }
        victims.len()
    }

    fn evict(&self, target_bytes: u64) -> bool {
        self.evict_returning(target_bytes).0
    }

    fn size_bytes(&self) -> u64 {
        self.inner.read().current_bytes
    }

    fn entry_count(&self) -> usize {
        self.inner.read().map.len()
    }

    fn contains(&self, fingerprint: &RangeFingerprint) -> bool {
        self.inner.read().map.contains_key(&fingerprint.cache_key())
    }

    fn stats(&self) -> LevelStats {
        let inner = self.inner.read();
        LevelStats::new(
            self.name(),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
            inner.current_bytes,
            self.capacity_bytes,
            inner.map.len() as u64,
        )
    }
}
