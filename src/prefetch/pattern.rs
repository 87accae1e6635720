// # Per-Key Access Patterns
//
// A bounded sliding window of access events per object key, with the
// derived features the predictors consume. Features are recomputed on
// every append; the window never exceeds its configured length.

use crate::common::AccessEvent;
use std::collections::VecDeque;
use std::time::Instant;

/// Fixed feature-name table. The learned predictor keys its weights by
/// these names, in this order.
pub const FEATURE_NAMES: [&str; 5] = [
    "sequentiality",
    "frequency",
    "recency",
    "mean_size",
    "mean_gap",
];

/// Size scale for the `mean_size` feature (1 MiB saturates to 1.0).
const SIZE_SCALE: f64 = 1024.0 * 1024.0;

/// Decay constant for the `recency` feature, in seconds.
const RECENCY_DECAY_SECS: f64 = 60.0;

/// Derived features of one key's window.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternFeatures {
    /// Fraction of adjacent event pairs where the later offset equals the
    /// earlier `offset + length`.
    pub sequentiality: f64,
    /// Events per second across the window span.
    pub frequency: f64,
    /// Exponential decay on time since the last event, in `(0, 1]`.
    pub recency: f64,
    /// Rolling mean request size, scaled so 1 MiB saturates to 1.0.
    pub mean_size: f64,
    /// Mean inter-arrival gap mapped into `(0, 1]` (short gaps near 1).
    pub mean_gap: f64,
}

impl PatternFeatures {
    /// Feature vector in `FEATURE_NAMES` order.
    pub fn as_vector(&self) -> [f64; 5] {
        [
            self.sequentiality,
            self.frequency.min(1.0),
            self.recency,
            self.mean_size,
            self.mean_gap,
        ]
    }
}

/// Sliding window and derived features for one key.
pub struct KeyPattern {
    window: VecDeque<AccessEvent>,
    capacity: usize,
    /// Features as of the previous append, used to label the learned
    /// predictor's last prediction once the next access arrives.
    pub last_features: Option<PatternFeatures>,
}

impl KeyPattern {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            last_features: None,
        }
    }

    /// Appends an event, evicting the oldest when full.
    pub fn record(&mut self, event: AccessEvent) {
        self.last_features = if self.window.is_empty() {
            None
        } else {
            Some(self.features())
        };
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn last(&self) -> Option<&AccessEvent> {
        self.window.back()
    }

    /// Whether `event` continues the window head-to-tail sequentially.
    pub fn continues_sequentially(&self, event: &AccessEvent) -> bool {
        self.window
            .back()
            .map(|prev| event.offset == prev.end())
            .unwrap_or(false)
    }

    /// Most recently seen fingerprints, newest first, excluding the last
    /// event itself. Used by the temporal predictor to re-warm a key.
    pub fn recent_ranges(&self, limit: usize) -> Vec<(u64, u64)> {
        let mut seen = Vec::new();
        for event in self.window.iter().rev().skip(1) {
            let range = (event.offset, event.length);
            if !seen.contains(&range) {
                seen.push(range);
            }
            if seen.len() >= limit {
                break;
            }
        }
        seen
    }

    /// Derives the current feature set from the window.
    pub fn features(&self) -> PatternFeatures {
        if self.window.is_empty() {
            return PatternFeatures::default();
        }

        let mut sequential_pairs = 0usize;
        let mut gap_total = 0.0f64;
        let pairs = self.window.len().saturating_sub(1);
        for pair in self.window.iter().zip(self.window.iter().skip(1)) {
            let (prev, next) = pair;
            if next.offset == prev.end() {
                sequential_pairs += 1;
            }
            gap_total += next
                .timestamp
                .saturating_duration_since(prev.timestamp)
                .as_secs_f64();
        }

        let sequentiality = if pairs == 0 {
            0.0
        } else {
            sequential_pairs as f64 / pairs as f64
        };

        let first = self.window.front().expect("non-empty window");
        let last = self.window.back().expect("non-empty window");
        let span = last
            .timestamp
            .saturating_duration_since(first.timestamp)
            .as_secs_f64();
        let frequency = if span <= f64::EPSILON {
            self.window.len() as f64
        } else {
            self.window.len() as f64 / span
        };

        let age = Instant::now()
            .saturating_duration_since(last.timestamp)
            .as_secs_f64();
        let recency = (-age / RECENCY_DECAY_SECS).exp();

        let mean_size_bytes = self.window.iter().map(|e| e.length as f64).sum::<f64>()
            / self.window.len() as f64;
        let mean_size = (mean_size_bytes / SIZE_SCALE).min(1.0);

        let mean_gap_secs = if pairs == 0 { 0.0 } else { gap_total / pairs as f64 };
        let mean_gap = 1.0 / (1.0 + mean_gap_secs);

        PatternFeatures {
            sequentiality,
            frequency,
            recency,
            mean_size,
            mean_gap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AccessEvent;

    fn event(offset: u64, length: u64) -> AccessEvent {
        AccessEvent::new("k", offset, length)
    }

    #[test]
    fn test_window_bounded() {
        let mut pattern = KeyPattern::new(4);
        for i in 0..10 {
            pattern.record(event(i * 8, 8));
        }
        assert_eq!(pattern.len(), 4);
    }

    #[test]
    fn test_sequentiality_of_pure_scan() {
        let mut pattern = KeyPattern::new(16);
        for i in 0..8 {
            pattern.record(event(i * 4096, 4096));
        }
        let features = pattern.features();
        assert!((features.sequentiality - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sequentiality_of_random_access() {
        let mut pattern = KeyPattern::new(16);
        for offset in [0u64, 90_000, 12, 77_000, 400] {
            pattern.record(event(offset, 64));
        }
        assert!(pattern.features().sequentiality < 0.5);
    }

    #[test]
    fn test_recency_fresh_window() {
        let mut pattern = KeyPattern::new(4);
        pattern.record(event(0, 1));
        assert!(pattern.features().recency > 0.9);
    }

    #[test]
    fn test_mean_size_saturates() {
        let mut pattern = KeyPattern::new(4);
        pattern.record(event(0, 512 * 1024));
        assert!((pattern.features().mean_size - 0.5).abs() < 1e-9);
        pattern.record(event(0, 16 * 1024 * 1024));
        assert!((pattern.features().mean_size - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_continues_sequentially() {
        let mut pattern = KeyPattern::new(4);
        pattern.record(event(0, 100));
        assert!(pattern.continues_sequentially(&event(100, 100)));
        assert!(!pattern.continues_sequentially(&event(101, 100)));
    }

    #[test]
    fn test_recent_ranges_deduped_newest_first() {
        let mut pattern = KeyPattern::new(8);
        pattern.record(event(0, 10));
        pattern.record(event(10, 10));
        pattern.record(event(0, 10));
        pattern.record(event(20, 10));
        let ranges = pattern.recent_ranges(4);
        assert_eq!(ranges, vec![(0, 10), (10, 10)]);
    }

    #[test]
    fn test_last_features_set_after_second_event() {
        let mut pattern = KeyPattern::new(4);
        pattern.record(event(0, 10));
        assert!(pattern.last_features.is_none());
        pattern.record(event(10, 10));
        assert!(pattern.last_features.is_some());
    }
}
