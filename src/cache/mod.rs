// # Range Cache
//
// Two-tier read cache for byte ranges of remote objects.
//
// ## Overview
//
// Entries are keyed by range fingerprint `(key, offset, length)` and live
// in a chain of levels: L1 in memory, optional L2 on disk. Levels are
// consulted in order on `get`; a hit at a slower level promotes the
// payload into the faster levels before returning. Placement of `put`s is
// policy-driven:
//
// - **inclusive**: write to every enabled level
// - **exclusive**: write only to L1; entries reach L2 via L1 eviction
// - **hybrid**: write to L1 always; write to L2 for large or hot payloads
//
// Every `get` and `put` is reported to the prefetcher as an access event
// over a bounded queue; a full queue drops events rather than blocking
// the read path.

pub mod memory;
pub mod persistent;
pub mod statistics;
pub mod tiered;

pub use memory::MemoryCache;
pub use persistent::{PersistentCache, PersistentCacheConfig};
pub use statistics::{ChainStats, LevelStats};
pub use tiered::TieredCache;

use crate::common::RangeFingerprint;
use crate::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default L1 capacity in bytes (256 MiB).
pub const DEFAULT_L1_CAPACITY_BYTES: u64 = 256 * 1024 * 1024;

/// Default maximum L1 entry count.
pub const DEFAULT_L1_MAX_ENTRIES: usize = 100_000;

/// Default promotion threshold for hybrid placement (1 MiB).
pub const DEFAULT_HYBRID_SIZE_THRESHOLD: u64 = 1024 * 1024;

/// Access count at which hybrid placement treats a fingerprint as hot.
pub const HYBRID_HOT_ACCESS_COUNT: u64 = 3;

/// Eviction policy for the in-memory level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict from the tail of the recency list.
    Lru,
    /// Rank entries by recency x frequency / size and evict the lowest.
    WeightedLru,
}

impl FromStr for EvictionPolicy {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lru" => Ok(EvictionPolicy::Lru),
            "weighted_lru" => Ok(EvictionPolicy::WeightedLru),
            other => Err(FsError::Configuration(format!(
                "unknown eviction policy: {}",
                other
            ))),
        }
    }
}

/// Placement policy across cache levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePlacement {
    Inclusive,
    Exclusive,
    Hybrid,
}

impl FromStr for CachePlacement {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inclusive" => Ok(CachePlacement::Inclusive),
            "exclusive" => Ok(CachePlacement::Exclusive),
            "hybrid" => Ok(CachePlacement::Hybrid),
            other => Err(FsError::Configuration(format!(
                "unknown cache placement: {}",
                other
            ))),
        }
    }
}

/// Who inserted a payload into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOrigin {
    /// Miss-fill or write-path insert on behalf of a user operation.
    User,
    /// Speculative insert by the prefetcher.
    Prefetch,
}

/// A successful lookup: an independent copy of the payload plus the
/// origin tag used for prefetch-efficiency accounting.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub data: Vec<u8>,
    pub prefetch_origin: bool,
}

/// Capability set every cache level implements.
pub trait CacheLevel: Send + Sync {
    fn name(&self) -> &'static str;

    fn get(&self, fingerprint: &RangeFingerprint) -> Option<CacheHit>;

    fn put(&self, fingerprint: &RangeFingerprint, data: &[u8], origin: PutOrigin) -> Result<()>;

    /// Removes every range of `key`; returns the number of entries removed.
    fn delete(&self, key: &str) -> usize;

    /// Removes entries overlapping `[offset, offset + length)` of `key`.
    fn invalidate_range(&self, key: &str, offset: u64, length: u64) -> usize;

    /// Frees at least `target_bytes` if possible; returns whether it did.
    fn evict(&self, target_bytes: u64) -> bool;

    fn size_bytes(&self) -> u64;

    fn entry_count(&self) -> usize;

    fn contains(&self, fingerprint: &RangeFingerprint) -> bool;

    fn stats(&self) -> LevelStats;
}

/// Cache configuration covering both levels and chain policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// L1 capacity in bytes.
    pub capacity_bytes: u64,

    /// L1 maximum entry count.
    pub max_entries: usize,

    /// Entry TTL from insertion; zero disables expiry.
    pub ttl: Duration,

    pub eviction_policy: EvictionPolicy,

    pub placement: CachePlacement,

    /// Payload size at or above which hybrid placement writes to L2.
    pub hybrid_size_threshold: u64,

    /// On-disk level; `None` runs L1 only.
    pub l2: Option<PersistentCacheConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_L1_CAPACITY_BYTES,
            max_entries: DEFAULT_L1_MAX_ENTRIES,
            ttl: Duration::ZERO,
            eviction_policy: EvictionPolicy::Lru,
            placement: CachePlacement::Inclusive,
            hybrid_size_threshold: DEFAULT_HYBRID_SIZE_THRESHOLD,
            l2: None,
        }
    }
}

impl CacheConfig {
    pub fn violations(&self) -> Vec<String> {
        let mut v = Vec::new();
        if self.capacity_bytes == 0 {
            v.push("cache.capacity_bytes must be greater than 0".to_string());
        }
        if self.max_entries == 0 {
            v.push("cache.max_entries must be greater than 0".to_string());
        }
        if self.hybrid_size_threshold == 0 && self.placement == CachePlacement::Hybrid {
            v.push("cache.hybrid_size_threshold must be greater than 0".to_string());
        }
        if let Some(l2) = &self.l2 {
            v.extend(l2.violations());
        }
        v
    }

    pub fn validate(&self) -> Result<()> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(FsError::Configuration(violations.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_names() {
        assert_eq!("lru".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lru);
        assert_eq!(
            "weighted_lru".parse::<EvictionPolicy>().unwrap(),
            EvictionPolicy::WeightedLru
        );
        assert!("mru".parse::<EvictionPolicy>().is_err());

        assert_eq!(
            "inclusive".parse::<CachePlacement>().unwrap(),
            CachePlacement::Inclusive
        );
        assert_eq!(
            "exclusive".parse::<CachePlacement>().unwrap(),
            CachePlacement::Exclusive
        );
        assert_eq!(
            "hybrid".parse::<CachePlacement>().unwrap(),
            CachePlacement::Hybrid
        );
        assert!("victim".parse::<CachePlacement>().is_err());
    }

    #[test]
    fn test_default_config_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = CacheConfig {
            capacity_bytes: 0,
            max_entries: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("capacity_bytes"));
        assert!(msg.contains("max_entries"));
    }
}
