// # In-Memory Backend
//
// Full `ObjectBackend` implementation over a concurrent map. Used by the
// test suite and by embedders that want the data path without a remote
// store. Carries fault-injection hooks so flush durability and retry
// behavior are testable.

use super::{ObjectBackend, ObjectMeta};
use crate::buffer::FlushTarget;
use crate::error::{FsError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// One recorded whole-object write, for assertions in tests.
#[derive(Debug, Clone)]
pub struct PutRecord {
    pub key: String,
    pub data: Vec<u8>,
}

/// One recorded coalesced flush from the write buffer.
#[derive(Debug, Clone)]
pub struct FlushRecord {
    pub key: String,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// In-memory object store.
pub struct MemoryBackend {
    objects: DashMap<String, Bytes>,
    put_log: Mutex<Vec<PutRecord>>,
    flush_log: Mutex<Vec<FlushRecord>>,
    /// Next N `put` calls fail with `Transient`.
    fail_puts: AtomicU32,
    /// Next N `flush` calls fail with `Transient`.
    fail_flushes: AtomicU32,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            put_log: Mutex::new(Vec::new()),
            flush_log: Mutex::new(Vec::new()),
            fail_puts: AtomicU32::new(0),
            fail_flushes: AtomicU32::new(0),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    /// Arrange for the next `n` `put` calls to fail with a transient error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Arrange for the next `n` flushes to fail with a transient error.
    pub fn fail_next_flushes(&self, n: u32) {
        self.fail_flushes.store(n, Ordering::SeqCst);
    }

    /// Seed an object directly, bypassing the put log.
    pub fn insert_object(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.insert(key.into(), data.into());
    }

    /// Writes `data` into `key` at `offset`, zero-extending the object if
    /// the write starts past the current end. This is the primitive a host
    /// uses to apply a flushed range to a whole-object store.
    pub fn write_at(&self, key: &str, offset: u64, data: &[u8]) {
        let mut obj = self
            .objects
            .get(key)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        let end = offset as usize + data.len();
        if obj.len() < end {
            obj.resize(end, 0);
        }
        obj[offset as usize..end].copy_from_slice(data);
        self.objects.insert(key.to_string(), Bytes::from(obj));
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|v| v.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Every whole-object `put` observed, in call order.
    pub fn put_records(&self) -> Vec<PutRecord> {
        self.put_log.lock().clone()
    }

    /// Every coalesced flush observed, in call order.
    pub fn flush_records(&self) -> Vec<FlushRecord> {
        self.flush_log.lock().clone()
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    fn take_injected_fault(counter: &AtomicU32) -> Option<FsError> {
        let mut current = counter.load(Ordering::SeqCst);
        while current > 0 {
            // Saturating counter: u32::MAX means "fail forever".
            if current == u32::MAX {
                return Some(FsError::Transient("injected fault".to_string()));
            }
            match counter.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    return Some(FsError::Transient("injected fault".to_string()));
                }
                Err(observed) => current = observed,
            }
        }
        None
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn get(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let obj = self
            .objects
            .get(key)
            .ok_or_else(|| FsError::NotFound(key.to_string()))?;
        let total = obj.len() as u64;
        if offset > total {
            return Err(FsError::NotFound(format!(
                "{}: offset {} past end {}",
                key, offset, total
            )));
        }
        let end = if len == 0 {
            total
        } else {
            (offset + len).min(total)
        };
        Ok(obj.slice(offset as usize..end as usize))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        if let Some(err) = Self::take_injected_fault(&self.fail_puts) {
            return Err(err);
        }
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.put_log.lock().push(PutRecord {
            key: key.to_string(),
            data: data.to_vec(),
        });
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let obj = self
            .objects
            .get(key)
            .ok_or_else(|| FsError::NotFound(key.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(obj.as_ref());
        Ok(ObjectMeta {
            size: obj.len() as u64,
            last_modified: Utc::now(),
            etag: hex::encode(&hasher.finalize()[..8]),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FlushTarget for MemoryBackend {
    async fn flush(&self, key: &str, base_offset: u64, data: Bytes) -> Result<()> {
        if let Some(err) = Self::take_injected_fault(&self.fail_flushes) {
            return Err(err);
        }
        self.flush_log.lock().push(FlushRecord {
            key: key.to_string(),
            offset: base_offset,
            data: data.to_vec(),
        });
        self.write_at(key, base_offset, &data);
        Ok(())
    }
}
