// # Byte Pool
//
// Size-bucketed reusable buffer pool for the read and write paths.
// Dampens allocator churn when the same transfer sizes recur, which is
// the common case for range reads against a remote object store.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide pool shared by callers that do not carry their own.
static GLOBAL_POOL: Lazy<BytePool> = Lazy::new(BytePool::new);

/// Bucket ladder, smallest to largest. Requests above the top rung are
/// heap-allocated and never pooled.
const BUCKET_SIZES: &[usize] = &[
    1024,              // 1 KiB
    4 * 1024,          // 4 KiB
    16 * 1024,         // 16 KiB
    64 * 1024,         // 64 KiB
    256 * 1024,        // 256 KiB
    1024 * 1024,       // 1 MiB
    4 * 1024 * 1024,   // 4 MiB
    16 * 1024 * 1024,  // 16 MiB
    64 * 1024 * 1024,  // 64 MiB
];

/// Maximum buffers retained per bucket.
const DEFAULT_BUCKET_DEPTH: usize = 32;

/// Byte pool statistics.
#[derive(Debug, Clone, Default)]
pub struct BytePoolStats {
    pub acquires: u64,
    pub releases: u64,
    pub pool_hits: u64,
    pub heap_allocs: u64,
    pub dropped: u64,
}

/// Size-bucketed buffer pool.
///
/// `acquire(n)` hands out a zeroed buffer of length `n` backed by the
/// smallest bucket that fits; `release` returns it for reuse. Buffers are
/// shared by convention only: callers must not retain a slice into a
/// released buffer.
pub struct BytePool {
    buckets: Vec<Mutex<Vec<Vec<u8>>>>,
    bucket_depth: usize,
    acquires: AtomicU64,
    releases: AtomicU64,
    pool_hits: AtomicU64,
    heap_allocs: AtomicU64,
    dropped: AtomicU64,
}

impl BytePool {
    pub fn new() -> Self {
        Self::with_bucket_depth(DEFAULT_BUCKET_DEPTH)
    }

    pub fn with_bucket_depth(bucket_depth: usize) -> Self {
        Self {
            buckets: BUCKET_SIZES.iter().map(|_| Mutex::new(Vec::new())).collect(),
            bucket_depth,
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            heap_allocs: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns a zeroed buffer of length `n`.
    ///
    /// The buffer's capacity is the bucket size, so `release` can route it
    /// back to the right bucket. Requests larger than the top bucket are
    /// plain heap allocations.
    pub fn acquire(&self, n: usize) -> Vec<u8> {
        self.acquires.fetch_add(1, Ordering::Relaxed);

        let Some(idx) = Self::bucket_index(n) else {
            self.heap_allocs.fetch_add(1, Ordering::Relaxed);
            return vec![0u8; n];
        };

        let mut bucket = self.buckets[idx].lock();
        if let Some(mut buf) = bucket.pop() {
            drop(bucket);
            self.pool_hits.fetch_add(1, Ordering::Relaxed);
            buf.resize(n, 0);
            return buf;
        }
        drop(bucket);

        self.heap_allocs.fetch_add(1, Ordering::Relaxed);
        let mut buf = Vec::with_capacity(BUCKET_SIZES[idx]);
        buf.resize(n, 0);
        buf
    }

    /// Zeroes the buffer and returns it to its bucket, or drops it if the
    /// bucket is full or the capacity does not match the ladder.
    pub fn release(&self, mut buf: Vec<u8>) {
        self.releases.fetch_add(1, Ordering::Relaxed);

        let cap = buf.capacity();
        let Some(idx) = BUCKET_SIZES.iter().position(|&s| s == cap) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        buf.clear();
        buf.resize(cap, 0);

        let mut bucket = self.buckets[idx].lock();
        if bucket.len() < self.bucket_depth {
            bucket.push(buf);
        } else {
            drop(bucket);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Bytes currently retained across all buckets.
    pub fn retained_bytes(&self) -> usize {
        self.buckets
            .iter()
            .zip(BUCKET_SIZES)
            .map(|(bucket, &size)| bucket.lock().len() * size)
            .sum()
    }

    pub fn stats(&self) -> BytePoolStats {
        BytePoolStats {
            acquires: self.acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            heap_allocs: self.heap_allocs.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn bucket_index(n: usize) -> Option<usize> {
        BUCKET_SIZES.iter().position(|&s| s >= n)
    }
}

impl BytePool {
    /// The process-wide shared pool.
    pub fn global() -> &'static BytePool {
        &GLOBAL_POOL
    }
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}
