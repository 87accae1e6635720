// # Predictive Prefetcher
//
// Observes the live access stream from the read cache, scores per-key
// patterns, and enqueues speculative range fetches ahead of demand.
//
// ## Predictor set
//
// Three predictors run per access event:
//
// - **Sequential**: strictly adjacent offsets project forward up to
//   `prefetch_ahead` candidates with decaying priority.
// - **Temporal**: frequently re-read keys re-warm their most recently
//   seen fingerprints.
// - **Learned**: an online logistic model over the pattern features
//   emits one candidate at the next expected offset when confident.
//
// Candidates are unioned, sorted by priority, truncated, and executed by
// a bounded worker pool behind a token-bucket bandwidth limiter. All
// prefetch I/O is best-effort: transient backend errors are swallowed
// into stats.

pub mod engine;
pub mod pattern;
pub mod predictor;
pub mod rate_limit;

pub use engine::{Prefetcher, PrefetchStats};
pub use pattern::{KeyPattern, PatternFeatures, FEATURE_NAMES};
pub use predictor::{LearnedPredictor, PrefetchCandidate, PrefetchJob};
pub use rate_limit::TokenBucket;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-key sliding window length.
pub const DEFAULT_WINDOW_SIZE: usize = 32;

/// Default bound on tracked keys.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

/// Prefetcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    pub enabled: bool,

    /// Events retained per key for feature derivation.
    pub window_size: usize,

    /// Bound on the pattern table; least-recently-updated key drops first.
    pub max_tracked_keys: usize,

    /// Maximum candidates per job.
    pub prefetch_ahead: usize,

    /// Worker pool size.
    pub max_concurrent_fetch: usize,

    /// Token-bucket rate for speculative fetches.
    pub bandwidth_bytes_per_sec: u64,

    /// Sequentiality fraction at which the sequential predictor fires.
    pub sequential_threshold: f64,

    /// Frequency score at which the temporal predictor fires.
    pub frequency_threshold: f64,

    /// Model confidence at which the learned predictor emits a candidate.
    pub confidence_threshold: f64,

    /// Online learning rate for the logistic model.
    pub learning_rate: f64,

    /// Per-candidate backend deadline.
    pub candidate_timeout: Duration,

    /// Bound on queued jobs; overflow drops the job.
    pub job_queue_depth: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: DEFAULT_WINDOW_SIZE,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
            prefetch_ahead: 4,
            max_concurrent_fetch: 4,
            bandwidth_bytes_per_sec: 64 * 1024 * 1024,
            sequential_threshold: 0.7,
            frequency_threshold: 2.0,
            confidence_threshold: 0.8,
            learning_rate: 0.1,
            candidate_timeout: Duration::from_secs(5),
            job_queue_depth: 64,
        }
    }
}

impl PrefetchConfig {
    pub fn violations(&self) -> Vec<String> {
        let mut v = Vec::new();
        if self.window_size == 0 {
            v.push("prefetch.window_size must be greater than 0".to_string());
        }
        if self.max_tracked_keys == 0 {
            v.push("prefetch.max_tracked_keys must be greater than 0".to_string());
        }
        if self.prefetch_ahead == 0 {
            v.push("prefetch.prefetch_ahead must be greater than 0".to_string());
        }
        if self.max_concurrent_fetch == 0 {
            v.push("prefetch.max_concurrent_fetch must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.sequential_threshold) {
            v.push("prefetch.sequential_threshold must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            v.push("prefetch.confidence_threshold must be in [0, 1]".to_string());
        }
        if self.learning_rate <= 0.0 {
            v.push("prefetch.learning_rate must be positive".to_string());
        }
        if self.job_queue_depth == 0 {
            v.push("prefetch.job_queue_depth must be greater than 0".to_string());
        }
        v
    }
}
