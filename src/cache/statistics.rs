// # Cache Statistics
//
// Per-level and chain-aggregated counters with the stable field names the
// metrics collaborator scrapes.

use serde::{Deserialize, Serialize};

/// Counters for one cache level. Rates are computed at snapshot time so
/// the serialized form carries them as plain fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelStats {
    pub level: String,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Live bytes in this level.
    pub size: u64,
    /// Configured capacity in bytes.
    pub capacity: u64,
    pub entries: u64,
    /// Hit rate in `[0, 1]`.
    pub hit_rate: f64,
    /// Fraction of capacity in use, in `[0, 1]`.
    pub utilization: f64,
}

impl LevelStats {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        level: &str,
        hits: u64,
        misses: u64,
        evictions: u64,
        size: u64,
        capacity: u64,
        entries: u64,
    ) -> Self {
        let total = hits + misses;
        Self {
            level: level.to_string(),
            hits,
            misses,
            evictions,
            size,
            capacity,
            entries,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            utilization: if capacity == 0 {
                0.0
            } else {
                (size as f64 / capacity as f64).min(1.0)
            },
        }
    }
}

/// Aggregated view across the whole chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainStats {
    pub levels: Vec<LevelStats>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
    pub capacity: u64,
    pub hit_rate: f64,
    pub utilization: f64,
    /// Operational health score derived from the chain hit rate.
    pub efficiency: f64,
}

impl ChainStats {
    /// Builds the aggregate from per-level snapshots plus the chain-level
    /// hit/miss counters (a chain hit is a hit at any level).
    pub fn aggregate(levels: Vec<LevelStats>, chain_hits: u64, chain_misses: u64) -> Self {
        let evictions = levels.iter().map(|l| l.evictions).sum();
        let size = levels.iter().map(|l| l.size).sum();
        let capacity = levels.iter().map(|l| l.capacity).sum();
        let total = chain_hits + chain_misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            chain_hits as f64 / total as f64
        };
        let utilization = if capacity == 0 {
            0.0
        } else {
            (size as f64 / capacity as f64).min(1.0)
        };
        Self {
            levels,
            hits: chain_hits,
            misses: chain_misses,
            evictions,
            size,
            capacity,
            hit_rate,
            utilization,
            // Health scoring: a cold cache is healthy, a thrashing one is
            // not, so efficiency tracks hit rate but holds a floor while
            // the sample count is small.
            efficiency: if total < 100 { hit_rate.max(0.5) } else { hit_rate },
        }
    }
}
