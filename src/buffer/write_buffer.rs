// # Write Buffer Core
//
// One mutex guards the key-to-slot map; each slot's `flushing` flag
// serializes flush attempts on that key. Flushing takes the payload out
// of the slot under the lock, calls the flush target without the lock,
// and on failure splices the payload back in front of anything that
// arrived meanwhile, so dirty bytes survive transient backend errors.

use super::{FlushTarget, WriteBufferConfig};
use crate::cache::TieredCache;
use crate::error::{FsError, Result};
use crate::metrics::MetricsRecorder;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Smoothing factor for the flush-latency running average.
const FLUSH_LATENCY_EMA_ALPHA: f64 = 0.1;

/// Poll period while `sync` waits for slots to drain.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Write buffer statistics with the stable field names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteBufferStats {
    pub total_writes: u64,
    pub total_flushes: u64,
    pub total_bytes: u64,
    pub pending_writes: u64,
    pub pending_bytes: u64,
    /// EMA of flush latency, in seconds.
    pub avg_flush_time: f64,
    pub errors: u64,
    pub last_flush: Option<DateTime<Utc>>,
}

struct Slot {
    base_offset: u64,
    payload: Vec<u8>,
    last_write: Instant,
    last_access: Instant,
    pending_ops: usize,
    dirty: bool,
    flushing: bool,
}

impl Slot {
    /// Highest end-offset written so far without a gap.
    fn end_offset(&self) -> u64 {
        self.base_offset + self.payload.len() as u64
    }
}

struct BufferState {
    slots: HashMap<String, Slot>,
    closed: bool,
}

struct LatencyStats {
    avg_flush_secs: f64,
    last_flush: Option<DateTime<Utc>>,
}

struct BufferCore {
    config: WriteBufferConfig,
    target: Arc<dyn FlushTarget>,
    /// Read cache to invalidate after successful flushes; `None` for
    /// hosts that wire coherence themselves.
    cache: Option<Arc<TieredCache>>,
    state: Mutex<BufferState>,
    flush_tx: mpsc::Sender<String>,
    total_writes: AtomicU64,
    total_flushes: AtomicU64,
    total_bytes: AtomicU64,
    errors: AtomicU64,
    latency: Mutex<LatencyStats>,
    metrics: Mutex<Option<Arc<dyn MetricsRecorder>>>,
}

impl BufferCore {
    fn write(&self, key: &str, offset: u64, data: &[u8], sync_bit: bool) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(FsError::Closed("write buffer is closed".to_string()));
        }

        let now = Instant::now();
        let mut trigger = sync_bit;

        match state.slots.get_mut(key) {
            Some(slot) => {
                if offset != slot.end_offset() {
                    return Err(FsError::NonContiguous(format!(
                        "{}: slot continues at offset {}, write is at {}",
                        key,
                        slot.end_offset(),
                        offset
                    )));
                }
                if slot.payload.len() + data.len() > self.config.max_buffer_size {
                    return Err(FsError::BufferFull(format!(
                        "{}: slot would exceed {} bytes",
                        key, self.config.max_buffer_size
                    )));
                }

                let idle = now.saturating_duration_since(slot.last_write);
                slot.payload.extend_from_slice(data);
                slot.last_write = now;
                slot.last_access = now;
                slot.pending_ops += 1;
                slot.dirty = true;

                trigger |= slot.payload.len() >= self.config.flush_threshold
                    || idle >= self.config.flush_interval
                    || slot.pending_ops > self.config.batch_size;
            }
            None => {
                if data.len() > self.config.max_buffer_size {
                    return Err(FsError::BufferFull(format!(
                        "{}: write of {} bytes exceeds slot cap {}",
                        key,
                        data.len(),
                        self.config.max_buffer_size
                    )));
                }
                if state.slots.len() >= self.config.max_buffers {
                    // Room is made by flushing, not dropping; that cannot
                    // complete inline, so schedule the least-recently-used
                    // slot and reject this write for the caller to retry.
                    let lru_key = state
                        .slots
                        .iter()
                        .filter(|(_, s)| !s.flushing)
                        .min_by_key(|(_, s)| s.last_access)
                        .map(|(k, _)| k.clone());
                    if let Some(lru_key) = lru_key {
                        self.schedule(&lru_key);
                    }
                    return Err(FsError::BufferFull(format!(
                        "{}: all {} slots in use, flush scheduled",
                        key, self.config.max_buffers
                    )));
                }

                state.slots.insert(
                    key.to_string(),
                    Slot {
                        base_offset: offset,
                        payload: data.to_vec(),
                        last_write: now,
                        last_access: now,
                        pending_ops: 1,
                        dirty: true,
                        flushing: false,
                    },
                );
                trigger |= data.len() >= self.config.flush_threshold;
            }
        }

        self.total_writes.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

        if trigger {
            self.schedule(key);
        }

        // Capacity pressure: above half the aggregate budget, force out
        // the largest quartile of slots.
        let aggregate: usize = state.slots.values().map(|s| s.payload.len()).sum();
        if aggregate > self.config.max_buffer_size * self.config.max_buffers / 2 {
            self.schedule_largest_quartile(&state);
        }

        Ok(())
    }

    fn schedule(&self, key: &str) {
        // A full queue is fine; the stale-slot ticker will catch the key.
        let _ = self.flush_tx.try_send(key.to_string());
    }

    fn schedule_largest_quartile(&self, state: &BufferState) {
        let mut sizes: Vec<(&String, usize)> = state
            .slots
            .iter()
            .filter(|(_, s)| s.dirty && !s.flushing)
            .map(|(k, s)| (k, s.payload.len()))
            .collect();
        if sizes.is_empty() {
            return;
        }
        sizes.sort_by(|a, b| b.1.cmp(&a.1));
        let quartile = (sizes.len() / 4).max(1);
        for (key, _) in sizes.into_iter().take(quartile) {
            self.schedule(key);
        }
    }

    fn schedule_all_dirty(&self) {
        let state = self.state.lock();
        for (key, slot) in state.slots.iter() {
            if slot.dirty && !slot.flushing {
                self.schedule(key);
            }
        }
    }

    fn schedule_stale(&self) {
        let state = self.state.lock();
        for (key, slot) in state.slots.iter() {
            if slot.dirty
                && !slot.flushing
                && slot.last_write.elapsed() >= self.config.flush_interval
            {
                self.schedule(key);
            }
        }
    }

    async fn flush_slot(&self, key: &str) {
        // Take the payload out under the lock; the slot keeps accepting
        // contiguous appends at the new base while the PUT is in flight.
        let (base, data) = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(key) else {
                return;
            };
            if slot.flushing || !slot.dirty || slot.payload.is_empty() {
                return;
            }
            slot.flushing = true;
            let data = std::mem::take(&mut slot.payload);
            let base = slot.base_offset;
            slot.base_offset = base + data.len() as u64;
            (base, Bytes::from(data))
        };

        let length = data.len() as u64;
        let started = Instant::now();
        let result = self.target.flush(key, base, data.clone()).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                // Coherence before slot deletion: overlapping cached
                // ranges must miss and repopulate from the backend.
                if let Some(cache) = &self.cache {
                    cache.invalidate_range(key, base, length);
                }

                let mut state = self.state.lock();
                let remove = match state.slots.get_mut(key) {
                    Some(slot) => {
                        slot.flushing = false;
                        slot.pending_ops = 0;
                        slot.payload.is_empty()
                    }
                    None => false,
                };
                if remove {
                    state.slots.remove(key);
                }
                drop(state);

                self.total_flushes.fetch_add(1, Ordering::Relaxed);
                let mut latency = self.latency.lock();
                let sample = elapsed.as_secs_f64();
                latency.avg_flush_secs = if latency.last_flush.is_none() {
                    sample
                } else {
                    FLUSH_LATENCY_EMA_ALPHA * sample
                        + (1.0 - FLUSH_LATENCY_EMA_ALPHA) * latency.avg_flush_secs
                };
                latency.last_flush = Some(Utc::now());
                drop(latency);
                if let Some(metrics) = self.metrics.lock().as_ref() {
                    metrics.record_operation("flush", elapsed);
                }
                debug!(key, base, length, "flushed slot");
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = self.metrics.lock().as_ref() {
                    metrics.record_error("flush");
                }
                warn!(key, base, length, error = %e, "flush failed, restoring payload");

                let mut state = self.state.lock();
                if let Some(slot) = state.slots.get_mut(key) {
                    // The taken bytes precede anything appended while the
                    // PUT was in flight.
                    let mut restored = data.to_vec();
                    restored.extend_from_slice(&slot.payload);
                    slot.payload = restored;
                    slot.base_offset = base;
                    slot.flushing = false;
                    slot.dirty = true;
                }
            }
        }
    }

    fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }
}

/// Per-key coalescing write buffer with background flush.
pub struct WriteBuffer {
    core: Arc<BufferCore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteBuffer {
    /// Starts the buffer and its flush coordinator. Must be called from
    /// within a tokio runtime.
    pub fn start(
        config: WriteBufferConfig,
        target: Arc<dyn FlushTarget>,
        cache: Option<Arc<TieredCache>>,
    ) -> Result<Self> {
        let violations = config.violations();
        if !violations.is_empty() {
            return Err(FsError::Configuration(violations.join("; ")));
        }

        let (flush_tx, mut flush_rx) = mpsc::channel::<String>(config.queue_depth);
        let flush_interval = config.flush_interval;
        let core = Arc::new(BufferCore {
            config,
            target,
            cache,
            state: Mutex::new(BufferState {
                slots: HashMap::new(),
                closed: false,
            }),
            flush_tx,
            total_writes: AtomicU64::new(0),
            total_flushes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency: Mutex::new(LatencyStats {
                avg_flush_secs: 0.0,
                last_flush: None,
            }),
            metrics: Mutex::new(None),
        });

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let coordinator = {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(flush_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        key = flush_rx.recv() => match key {
                            Some(key) => core.flush_slot(&key).await,
                            None => break,
                        },
                        _ = ticker.tick() => core.schedule_stale(),
                        _ = shutdown_rx.changed() => break,
                    }
                }
            })
        };

        Ok(Self {
            core,
            shutdown,
            tasks: Mutex::new(vec![coordinator]),
        })
    }

    /// Buffers `data` at `offset` of `key`. Accepted iff contiguous with
    /// the slot and within the per-slot cap; `sync_bit` additionally
    /// triggers an immediate background flush.
    pub fn write(&self, key: &str, offset: u64, data: &[u8], sync_bit: bool) -> Result<()> {
        self.core.write(key, offset, data, sync_bit)
    }

    /// Wires the metrics collaborator.
    pub fn set_metrics(&self, recorder: Arc<dyn MetricsRecorder>) {
        *self.core.metrics.lock() = Some(recorder);
    }

    /// Schedules a flush of `key` without waiting.
    pub fn flush(&self, key: &str) {
        self.core.schedule(key);
    }

    /// Schedules a flush of every dirty slot without waiting.
    pub fn flush_all(&self) {
        self.core.schedule_all_dirty();
    }

    /// Flushes everything and waits until no slots remain, bounded by
    /// twice the configured max write delay.
    pub async fn sync(&self) -> Result<()> {
        if self.core.state.lock().closed {
            return Err(FsError::Closed("write buffer is closed".to_string()));
        }
        self.core.schedule_all_dirty();

        let deadline = self.core.config.max_write_delay * 2;
        let drained = tokio::time::timeout(deadline, async {
            loop {
                if self.core.slot_count() == 0 {
                    return;
                }
                // Renudge so failed flushes are retried within the window.
                self.core.schedule_all_dirty();
                tokio::time::sleep(SYNC_POLL_INTERVAL).await;
            }
        })
        .await;

        drained.map_err(|_| {
            FsError::Timeout(format!(
                "sync deadline {:?} elapsed with {} dirty slots",
                deadline,
                self.core.slot_count()
            ))
        })
    }

    /// Forces flushes when aggregate buffered bytes exceed half of the
    /// configured budget; the largest quartile of slots goes first.
    pub fn optimize(&self) {
        let state = self.core.state.lock();
        let aggregate: usize = state.slots.values().map(|s| s.payload.len()).sum();
        if aggregate > self.core.config.max_buffer_size * self.core.config.max_buffers / 2 {
            self.core.schedule_largest_quartile(&state);
        }
    }

    /// Syncs (when configured), then stops the coordinator. Writes after
    /// close fail with `Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.core.config.sync_on_close {
            self.sync().await?;
        }
        self.core.state.lock().closed = true;
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        futures::future::join_all(tasks).await;
        Ok(())
    }

    /// Dirty slots currently held.
    pub fn slot_count(&self) -> usize {
        self.core.slot_count()
    }

    pub fn stats(&self) -> WriteBufferStats {
        let state = self.core.state.lock();
        let pending_writes = state.slots.values().map(|s| s.pending_ops as u64).sum();
        let pending_bytes = state.slots.values().map(|s| s.payload.len() as u64).sum();
        drop(state);
        let latency = self.core.latency.lock();
        WriteBufferStats {
            total_writes: self.core.total_writes.load(Ordering::Relaxed),
            total_flushes: self.core.total_flushes.load(Ordering::Relaxed),
            total_bytes: self.core.total_bytes.load(Ordering::Relaxed),
            pending_writes,
            pending_bytes,
            avg_flush_time: latency.avg_flush_secs,
            errors: self.core.errors.load(Ordering::Relaxed),
            last_flush: latency.last_flush,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cache::{CacheConfig, PutOrigin, TieredCache};

    fn fast_config() -> WriteBufferConfig {
        WriteBufferConfig {
            flush_interval: Duration::from_millis(50),
            max_write_delay: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn buffer_with_backend(config: WriteBufferConfig) -> (WriteBuffer, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let buffer =
            WriteBuffer::start(config, Arc::clone(&backend) as Arc<dyn FlushTarget>, None)
                .unwrap();
        (buffer, backend)
    }

    #[tokio::test]
    async fn test_contiguous_writes_coalesce_into_one_flush() {
        let (buffer, backend) = buffer_with_backend(fast_config());
        buffer.write("f", 0, b"Hello, ", false).unwrap();
        buffer.write("f", 7, b"World!", false).unwrap();
        buffer
            .write("f", 13, b" This should be coalesced.", false)
            .unwrap();
        buffer.sync().await.unwrap();

        let records = backend.flush_records();
        let for_f: Vec<_> = records.iter().filter(|r| r.key == "f").collect();
        assert_eq!(for_f.len(), 1);
        assert_eq!(for_f[0].offset, 0);
        assert_eq!(for_f[0].data, b"Hello, World! This should be coalesced.");
    }

    #[tokio::test]
    async fn test_gap_write_rejected() {
        let (buffer, _backend) = buffer_with_backend(fast_config());
        buffer.write("k", 0, b"12345", false).unwrap();
        let err = buffer.write("k", 10, b"xyz", false).unwrap_err();
        assert!(matches!(err, FsError::NonContiguous(_)));
    }

    #[tokio::test]
    async fn test_slot_cap_rejected_as_buffer_full() {
        let config = WriteBufferConfig {
            max_buffer_size: 8,
            flush_threshold: 8,
            ..fast_config()
        };
        let (buffer, _backend) = buffer_with_backend(config);
        buffer.write("k", 0, b"12345", false).unwrap();
        let err = buffer.write("k", 5, b"67890", false).unwrap_err();
        assert!(matches!(err, FsError::BufferFull(_)));
    }

    #[tokio::test]
    async fn test_sync_makes_bytes_durable() {
        let (buffer, backend) = buffer_with_backend(fast_config());
        buffer.write("obj", 0, b"abc", false).unwrap();
        buffer.write("obj", 3, b"def", false).unwrap();
        buffer.sync().await.unwrap();
        assert_eq!(buffer.slot_count(), 0);
        assert_eq!(&backend.object("obj").unwrap()[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_flush_threshold_triggers_background_flush() {
        let config = WriteBufferConfig {
            flush_threshold: 4,
            ..fast_config()
        };
        let (buffer, backend) = buffer_with_backend(config);
        buffer.write("k", 0, b"123456", false).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(&backend.object("k").unwrap()[..], b"123456");
        assert_eq!(buffer.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_slots_flushed_by_ticker() {
        let (buffer, backend) = buffer_with_backend(fast_config());
        buffer.write("k", 0, b"stale", false).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(&backend.object("k").unwrap()[..], b"stale");
    }

    #[tokio::test]
    async fn test_flush_failure_keeps_dirty_data() {
        let (buffer, backend) = buffer_with_backend(fast_config());
        backend.fail_next_flushes(1);
        buffer.write("k", 0, b"precious", false).unwrap();
        buffer.flush("k");
        tokio::time::sleep(Duration::from_millis(30)).await;

        // First attempt failed; the payload is back in the slot.
        assert!(buffer.stats().errors >= 1);
        assert_eq!(buffer.slot_count(), 1);

        // The retry succeeds and the data lands intact.
        buffer.sync().await.unwrap();
        assert_eq!(&backend.object("k").unwrap()[..], b"precious");
    }

    #[tokio::test]
    async fn test_sync_times_out_when_backend_stays_down() {
        let config = WriteBufferConfig {
            max_write_delay: Duration::from_millis(50),
            ..fast_config()
        };
        let (buffer, backend) = buffer_with_backend(config);
        backend.fail_next_flushes(u32::MAX);
        buffer.write("k", 0, b"stuck", false).unwrap();
        let err = buffer.sync().await.unwrap_err();
        assert!(matches!(err, FsError::Timeout(_)));
        // The dirty payload is still held.
        assert_eq!(buffer.slot_count(), 1);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (buffer, _backend) = buffer_with_backend(fast_config());
        buffer.close().await.unwrap();
        let err = buffer.write("k", 0, b"late", false).unwrap_err();
        assert!(matches!(err, FsError::Closed(_)));
    }

    #[tokio::test]
    async fn test_slot_exhaustion_rejects_and_schedules() {
        let config = WriteBufferConfig {
            max_buffers: 2,
            ..fast_config()
        };
        let (buffer, backend) = buffer_with_backend(config);
        buffer.write("a", 0, b"1", false).unwrap();
        buffer.write("b", 0, b"2", false).unwrap();
        let err = buffer.write("c", 0, b"3", false).unwrap_err();
        assert!(matches!(err, FsError::BufferFull(_)));

        // The scheduled flush eventually frees a slot for a retry.
        tokio::time::sleep(Duration::from_millis(100)).await;
        buffer.write("c", 0, b"3", false).unwrap();
        buffer.sync().await.unwrap();
        assert!(backend.object("c").is_some());
    }

    #[tokio::test]
    async fn test_flush_invalidates_overlapping_cache_entries() {
        let cache = Arc::new(TieredCache::new(CacheConfig::default()).unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let buffer = WriteBuffer::start(
            fast_config(),
            Arc::clone(&backend) as Arc<dyn FlushTarget>,
            Some(Arc::clone(&cache)),
        )
        .unwrap();

        cache.put("k", 0, b"stalestale", PutOrigin::User).unwrap();
        cache.put("k", 100, b"far", PutOrigin::User).unwrap();

        buffer.write("k", 2, b"fresh", false).unwrap();
        buffer.sync().await.unwrap();

        // Overlapping entry gone, disjoint entry untouched.
        assert!(cache.get("k", 0, 10).is_none());
        assert!(cache.get("k", 100, 3).is_some());
    }

    #[tokio::test]
    async fn test_writes_during_flush_are_preserved() {
        let (buffer, backend) = buffer_with_backend(fast_config());
        buffer.write("k", 0, b"first", false).unwrap();
        buffer.flush("k");
        // Appends racing the in-flight flush stay contiguous at the new
        // base and flush in a second PUT.
        buffer.write("k", 5, b"second", false).unwrap();
        buffer.sync().await.unwrap();
        assert_eq!(&backend.object("k").unwrap()[..], b"firstsecond");
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let (buffer, _backend) = buffer_with_backend(fast_config());
        buffer.write("k", 0, b"1234", false).unwrap();
        buffer.write("k", 4, b"56", false).unwrap();
        let stats = buffer.stats();
        assert_eq!(stats.total_writes, 2);
        assert_eq!(stats.total_bytes, 6);
        assert_eq!(stats.pending_bytes, 6);

        buffer.sync().await.unwrap();
        let stats = buffer.stats();
        assert_eq!(stats.total_flushes, 1);
        assert_eq!(stats.pending_bytes, 0);
        assert!(stats.last_flush.is_some());
    }
}
