// # Persistent Cache Level (L2)
//
// On-disk range cache. Each entry is one file named by a truncated
// SHA-256 of the fingerprint; a JSON index maps fingerprints to file
// metadata. Index saves are atomic (write `.tmp`, rename over), payload
// integrity is a SHA-256 over the original bytes, and every path must
// canonicalize inside the cache directory or the cache refuses to start.
//
// Background duties (TTL sweep, capacity eviction, index sync) run on
// independent tokio tickers when a runtime is available; `optimize()`
// performs the same work synchronously for hosts without one.

use super::statistics::LevelStats;
use super::{CacheHit, CacheLevel, PutOrigin};
use crate::common::RangeFingerprint;
use crate::error::{FsError, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Index file name inside the cache directory.
pub const INDEX_FILE_NAME: &str = "cache-index.json";

/// Extension of per-entry payload files.
const ENTRY_FILE_EXT: &str = "cache";

/// Persistent cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentCacheConfig {
    pub directory: PathBuf,

    /// Capacity in bytes of *on-disk* sizes.
    pub capacity_bytes: u64,

    /// Entry TTL from insertion; zero disables expiry.
    pub ttl: Duration,

    /// Gzip-compress payloads on disk.
    pub compression: bool,

    /// Period of the TTL sweep / capacity eviction ticker.
    pub cleanup_interval: Duration,

    /// Period of the index persistence ticker.
    pub index_sync_interval: Duration,

    /// Index file name, resolved inside `directory`.
    pub index_file: String,
}

impl Default for PersistentCacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./rusty-fs-cache"),
            capacity_bytes: 1024 * 1024 * 1024,
            ttl: Duration::ZERO,
            compression: false,
            cleanup_interval: Duration::from_secs(60),
            index_sync_interval: Duration::from_secs(30),
            index_file: INDEX_FILE_NAME.to_string(),
        }
    }
}

impl PersistentCacheConfig {
    pub fn violations(&self) -> Vec<String> {
        let mut v = Vec::new();
        if self.capacity_bytes == 0 {
            v.push("cache.l2.capacity_bytes must be greater than 0".to_string());
        }
        if self.cleanup_interval.is_zero() {
            v.push("cache.l2.cleanup_interval must be greater than 0".to_string());
        }
        if self.index_sync_interval.is_zero() {
            v.push("cache.l2.index_sync_interval must be greater than 0".to_string());
        }
        if self.index_file.is_empty() {
            v.push("cache.l2.index_file must not be empty".to_string());
        }
        v
    }
}

/// One index record. The checksum is over the *original* payload; the
/// stored length is the on-disk (possibly compressed) size and is what
/// counts toward capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    fingerprint: RangeFingerprint,
    path: PathBuf,
    stored_length: u64,
    original_length: u64,
    inserted_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    compressed: bool,
    checksum: String,
    #[serde(default)]
    prefetched: bool,
}

impl IndexEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let age = Utc::now().signed_duration_since(self.inserted_at);
        age.to_std().map(|a| a > ttl).unwrap_or(false)
    }
}

struct DiskState {
    index: HashMap<String, IndexEntry>,
    current_bytes: u64,
    dirty: bool,
}

/// On-disk cache level.
pub struct PersistentCache {
    directory: PathBuf,
    index_path: PathBuf,
    capacity_bytes: u64,
    ttl: Duration,
    compression: bool,
    state: RwLock<DiskState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistentCache {
    /// Opens (or creates) the cache directory, validates path confinement,
    /// loads the index, and starts maintenance tickers when called inside
    /// a tokio runtime.
    pub fn new(config: PersistentCacheConfig) -> Result<Arc<Self>> {
        let violations = config.violations();
        if !violations.is_empty() {
            return Err(FsError::Configuration(violations.join("; ")));
        }

        fs::create_dir_all(&config.directory)?;
        let directory = config.directory.canonicalize()?;

        let index_path = directory.join(&config.index_file);
        let parent = index_path
            .parent()
            .ok_or_else(|| FsError::Configuration("index file has no parent".to_string()))?;
        let canonical_parent = parent.canonicalize().map_err(|e| {
            FsError::Configuration(format!(
                "index file parent {} cannot be resolved: {}",
                parent.display(),
                e
            ))
        })?;
        if canonical_parent != directory {
            return Err(FsError::Configuration(format!(
                "index file {} escapes cache directory {}",
                index_path.display(),
                directory.display()
            )));
        }

        let state = Self::load_index(&directory, &index_path)?;
        let (shutdown, _) = watch::channel(false);

        let cache = Arc::new(Self {
            directory,
            index_path,
            capacity_bytes: config.capacity_bytes,
            ttl: config.ttl,
            compression: config.compression,
            state: RwLock::new(state),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        // Tickers only exist inside a runtime; synchronous hosts drive
        // maintenance through optimize().
        if tokio::runtime::Handle::try_current().is_ok() {
            Self::spawn_maintenance(&cache, config.cleanup_interval, config.index_sync_interval);
        }

        Ok(cache)
    }

    fn load_index(directory: &Path, index_path: &Path) -> Result<DiskState> {
        let mut state = DiskState {
            index: HashMap::new(),
            current_bytes: 0,
            dirty: false,
        };

        if !index_path.exists() {
            return Ok(state);
        }

        let raw = fs::read_to_string(index_path)?;
        let parsed: HashMap<String, IndexEntry> = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "cache index unreadable, starting empty");
                return Ok(state);
            }
        };

        for (cache_key, entry) in parsed {
            if !entry.path.is_absolute() {
                return Err(FsError::Fatal(format!(
                    "cache index entry {} has relative path {}",
                    cache_key,
                    entry.path.display()
                )));
            }
            match entry.path.canonicalize() {
                Ok(canonical) => {
                    if !canonical.starts_with(directory) {
                        return Err(FsError::Fatal(format!(
                            "cache index entry {} escapes cache directory: {}",
                            cache_key,
                            entry.path.display()
                        )));
                    }
                    state.current_bytes += entry.stored_length;
                    state.index.insert(cache_key, entry);
                }
                // File gone since the last save: drop the entry.
                Err(_) => {
                    debug!(cache_key, "dropping index entry with missing file");
                }
            }
        }

        Ok(state)
    }

    fn spawn_maintenance(this: &Arc<Self>, cleanup_interval: Duration, sync_interval: Duration) {
        let mut tasks = this.tasks.lock();

        let cache = Arc::clone(this);
        let mut rx = this.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.ttl_sweep();
                        cache.enforce_capacity();
                    }
                    _ = rx.changed() => break,
                }
            }
        }));

        let cache = Arc::clone(this);
        let mut rx = this.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.save_index() {
                            error!(error = %e, "periodic index save failed");
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        }));
    }

    /// Stops maintenance tickers and performs a final index save.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        futures::future::join_all(tasks).await;
        self.save_index()
    }

    /// Synchronous maintenance: TTL sweep, capacity eviction, index save.
    pub fn optimize(&self) -> Result<()> {
        self.ttl_sweep();
        self.enforce_capacity();
        self.save_index()
    }

    /// Persists the index atomically: serialize a snapshot, write to a
    /// `.tmp` sibling, rename over the live file.
    pub fn save_index(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write();
            state.dirty = false;
            state.index.clone()
        };

        for entry in snapshot.values() {
            if !entry.path.starts_with(&self.directory) {
                return Err(FsError::Fatal(format!(
                    "refusing to save index entry outside cache directory: {}",
                    entry.path.display()
                )));
            }
        }

        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp = self.index_path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.index_path)?;
        Ok(())
    }

    fn ttl_sweep(&self) {
        if self.ttl.is_zero() {
            return;
        }
        let mut state = self.state.write();
        let expired: Vec<String> = state
            .index
            .iter()
            .filter(|(_, e)| e.is_expired(self.ttl))
            .map(|(k, _)| k.clone())
            .collect();
        for cache_key in expired {
            self.remove_locked(&mut state, &cache_key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn enforce_capacity(&self) {
        let mut state = self.state.write();
        while state.current_bytes > self.capacity_bytes {
            if !self.evict_oldest_locked(&mut state) {
                break;
            }
        }
    }

    /// Oldest last-access first. Returns whether a victim was found.
    fn evict_oldest_locked(&self, state: &mut DiskState) -> bool {
        let victim = state
            .index
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone());
        match victim {
            Some(cache_key) => {
                self.remove_locked(state, &cache_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn remove_locked(&self, state: &mut DiskState, cache_key: &str) -> Option<IndexEntry> {
        let entry = state.index.remove(cache_key)?;
        state.current_bytes = state.current_bytes.saturating_sub(entry.stored_length);
        state.dirty = true;
        if let Err(e) = fs::remove_file(&entry.path) {
            debug!(path = %entry.path.display(), error = %e, "entry file removal failed");
        }
        Some(entry)
    }

    fn entry_path(&self, cache_key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(cache_key.as_bytes());
        let name = hex::encode(&hasher.finalize()[..8]);
        self.directory.join(format!("{}.{}", name, ENTRY_FILE_EXT))
    }

    fn checksum_hex(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}

impl CacheLevel for PersistentCache {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn get(&self, fingerprint: &RangeFingerprint) -> Option<CacheHit> {
        let cache_key = fingerprint.cache_key();

        let entry = {
            let state = self.state.read();
            match state.index.get(&cache_key) {
                Some(e) => e.clone(),
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };

        if entry.is_expired(self.ttl) {
            let mut state = self.state.write();
            self.remove_locked(&mut state, &cache_key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // File read happens without the lock; a concurrent replace is fine
        // because entry files are swapped in by rename.
        let stored = match fs::read(&entry.path) {
            Ok(b) => b,
            Err(e) => {
                debug!(cache_key, error = %e, "entry file unreadable, dropping");
                let mut state = self.state.write();
                self.remove_locked(&mut state, &cache_key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let payload = if entry.compressed {
            let mut decoder = GzDecoder::new(stored.as_slice());
            let mut out = Vec::with_capacity(entry.original_length as usize);
            match decoder.read_to_end(&mut out) {
                Ok(_) => out,
                Err(e) => {
                    warn!(cache_key, error = %e, "entry failed to decompress, dropping");
                    let mut state = self.state.write();
                    self.remove_locked(&mut state, &cache_key);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        } else {
            stored
        };

        if payload.len() as u64 != entry.original_length
            || Self::checksum_hex(&payload) != entry.checksum
        {
            warn!(cache_key, "checksum mismatch, dropping corrupted entry");
            let mut state = self.state.write();
            self.remove_locked(&mut state, &cache_key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        {
            let mut state = self.state.write();
            if let Some(live) = state.index.get_mut(&cache_key) {
                live.last_access = Utc::now();
                // Consumed by the first read, as in L1.
                live.prefetched = false;
            }
            state.dirty = true;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheHit {
            data: payload,
            prefetch_origin: entry.prefetched,
        })
    }

    fn put(&self, fingerprint: &RangeFingerprint, data: &[u8], origin: PutOrigin) -> Result<()> {
        let cache_key = fingerprint.cache_key();
        let path = self.entry_path(&cache_key);

        // The write lock is held across file I/O so a racing put for the
        // same fingerprint cannot interleave file and index updates.
        let mut state = self.state.write();

        if let Some(existing) = state.index.get(&cache_key) {
            if origin == PutOrigin::Prefetch && !existing.prefetched {
                return Ok(());
            }
        }

        let stored: Vec<u8> = if self.compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?
        } else {
            data.to_vec()
        };

        let tmp = path.with_extension(format!("{}.tmp", ENTRY_FILE_EXT));
        fs::write(&tmp, &stored)?;
        fs::rename(&tmp, &path)?;

        let now = Utc::now();
        let new_entry = IndexEntry {
            fingerprint: fingerprint.clone(),
            path,
            stored_length: stored.len() as u64,
            original_length: data.len() as u64,
            inserted_at: now,
            last_access: now,
            compressed: self.compression,
            checksum: Self::checksum_hex(data),
            prefetched: origin == PutOrigin::Prefetch,
        };

        if let Some(old) = state.index.insert(cache_key, new_entry) {
            state.current_bytes = state.current_bytes.saturating_sub(old.stored_length);
        }
        state.current_bytes += stored.len() as u64;
        state.dirty = true;

        while state.current_bytes > self.capacity_bytes {
            if !self.evict_oldest_locked(&mut state) {
                break;
            }
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> usize {
        let prefix = RangeFingerprint::key_prefix(key);
        let mut state = self.state.write();
        let victims: Vec<String> = state
            .index
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for cache_key in &victims {
            self.remove_locked(&mut state, cache_key);
        }
        victims.len()
    }

    fn invalidate_range(&self, key: &str, offset: u64, length: u64) -> usize {
        let mut state = self.state.write();
        let victims: Vec<String> = state
            .index
            .values()
            .filter(|e| e.fingerprint.key == key && e.fingerprint.overlaps(offset, length))
            .map(|e| e.fingerprint.cache_key())
            .collect();
        for cache_key in &victims {
            self.remove_locked(&mut state, cache_key);
        }
        victims.len()
    }

    fn evict(&self, target_bytes: u64) -> bool {
        let mut state = self.state.write();
        let mut freed = 0u64;
        while freed < target_bytes {
            let before = state.current_bytes;
            if !self.evict_oldest_locked(&mut state) {
                break;
            }
            freed += before - state.current_bytes;
        }
        freed >= target_bytes
    }

    fn size_bytes(&self) -> u64 {
        self.state.read().current_bytes
    }

    fn entry_count(&self) -> usize {
        self.state.read().index.len()
    }

    fn contains(&self, fingerprint: &RangeFingerprint) -> bool {
        self.state.read().index.contains_key(&fingerprint.cache_key())
    }

    fn stats(&self) -> LevelStats {
        let state = self.state.read();
        LevelStats::new(
            self.name(),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
            state.current_bytes,
            self.capacity_bytes,
            state.index.len() as u64,
        )
    }
}
