// # Object Backend Contract
//
// The narrow interface the data path consumes from the remote store.
// Real providers (S3 and friends) live behind this trait in a separate
// collaborator crate; this module carries the trait itself, an in-memory
// implementation for tests and embedders, and a retrying decorator that
// owns the transient-error retry budget.

pub mod memory;
pub mod retry;

pub use memory::MemoryBackend;
pub use retry::{RetryPolicy, RetryingBackend};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Object metadata as returned by `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

/// Remote object store operations consumed by the core.
///
/// The store is assumed eventually consistent and high-latency; callers
/// bound each call with a deadline (`tokio::time::timeout`), and the
/// cache-invalidation rules above this trait are what make read-after-write
/// feel strong for the local mount.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Range read. `len == 0` means "to end of object".
    async fn get(&self, key: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Whole-object write; on success the object is visible to subsequent
    /// `get` calls on this backend handle.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn head(&self, key: &str) -> Result<ObjectMeta>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Batch read. The default implementation issues sequential `get`s;
    /// providers with a native batch API override it.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            out.insert(key.clone(), self.get(key, 0, 0).await?);
        }
        Ok(out)
    }

    /// Batch write. Default: sequential `put`s.
    async fn put_many(&self, objects: HashMap<String, Bytes>) -> Result<()> {
        for (key, data) in objects {
            self.put(&key, data).await?;
        }
        Ok(())
    }

    /// Cheap liveness probe.
    async fn health(&self) -> Result<()>;
}
