// # Write Buffer
//
// Per-key in-memory buffers accepting contiguous writes, coalesced into
// single backend PUTs by a background flush coordinator.
//
// ## Contract
//
// - `write` accepts a chunk iff it is contiguous with the slot and fits
//   under the per-slot cap; anything else is a typed error and the caller
//   flushes first or PUTs directly.
// - `sync` waits until every dirty slot has flushed, bounded by twice the
//   configured max write delay.
// - Flush failures never drop dirty data: the payload is restored to the
//   slot and retried by a later trigger.
// - A successful flush invalidates every overlapping read-cache entry
//   before the slot is deleted, so subsequent reads repopulate from the
//   backend instead of serving stale bytes.
//
// ## Slot life cycle
//
// ```text
// (none) --write--> Dirty --trigger--> Dirty+FlushPending --worker--> Dirty+Flushing
//                                                                       | success
//                                                                       v
//                                                                     (none)
//                                        ^ failure
//                                        +------ Dirty (flushing cleared)
// ```

pub mod write_buffer;

pub use write_buffer::{WriteBuffer, WriteBufferStats};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Receiver of coalesced flushes. Hosts wire this to the backend PUT
/// path (whole-object read-modify-write for offset writes, multipart for
/// large ones); tests record the calls.
#[async_trait]
pub trait FlushTarget: Send + Sync {
    async fn flush(&self, key: &str, base_offset: u64, data: Bytes) -> Result<()>;
}

/// Write buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBufferConfig {
    /// Per-slot payload cap in bytes.
    pub max_buffer_size: usize,

    /// Maximum concurrent slots.
    pub max_buffers: usize,

    /// Payload size that triggers an automatic flush.
    pub flush_threshold: usize,

    /// Staleness bound; the ticker flushes slots idle this long.
    pub flush_interval: Duration,

    /// `sync` deadline is twice this value.
    pub max_write_delay: Duration,

    /// Pending-operation count that triggers an automatic flush.
    pub batch_size: usize,

    /// Run a full sync before shutting down in `close`.
    pub sync_on_close: bool,

    /// Bound on the flush-request queue.
    pub queue_depth: usize,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 8 * 1024 * 1024,
            max_buffers: 256,
            flush_threshold: 4 * 1024 * 1024,
            flush_interval: Duration::from_secs(5),
            max_write_delay: Duration::from_secs(10),
            batch_size: 100,
            sync_on_close: true,
            queue_depth: 256,
        }
    }
}

impl WriteBufferConfig {
    pub fn violations(&self) -> Vec<String> {
        let mut v = Vec::new();
        if self.max_buffer_size == 0 {
            v.push("write_buffer.max_buffer_size must be greater than 0".to_string());
        }
        if self.max_buffers == 0 {
            v.push("write_buffer.max_buffers must be greater than 0".to_string());
        }
        if self.flush_threshold == 0 {
            v.push("write_buffer.flush_threshold must be greater than 0".to_string());
        }
        if self.flush_threshold > self.max_buffer_size {
            v.push("write_buffer.flush_threshold must not exceed max_buffer_size".to_string());
        }
        if self.flush_interval.is_zero() {
            v.push("write_buffer.flush_interval must be greater than 0".to_string());
        }
        if self.max_write_delay.is_zero() {
            v.push("write_buffer.max_write_delay must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            v.push("write_buffer.batch_size must be greater than 0".to_string());
        }
        if self.queue_depth == 0 {
            v.push("write_buffer.queue_depth must be greater than 0".to_string());
        }
        v
    }
}
