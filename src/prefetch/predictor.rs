// # Predictor Set
//
// Three candidate generators run per access event. Sequential projection
// and temporal re-warming are pure functions of the key's pattern; the
// learned predictor keeps an online logistic model whose weights update
// per labeled event.

use super::pattern::{KeyPattern, PatternFeatures, FEATURE_NAMES};
use crate::common::RangeFingerprint;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

/// A speculative fingerprint with its scheduling priority.
#[derive(Debug, Clone)]
pub struct PrefetchCandidate {
    pub fingerprint: RangeFingerprint,
    pub priority: f64,
}

/// One unit of work for the fetch workers. Never constructed empty.
#[derive(Debug, Clone)]
pub struct PrefetchJob {
    pub candidates: Vec<PrefetchCandidate>,
    /// Soft deadline; workers drop the job past it.
    pub deadline: Instant,
}

/// Projects a sequential scan forward.
pub struct SequentialPredictor {
    pub threshold: f64,
    pub lookahead: usize,
}

impl SequentialPredictor {
    pub fn predict(&self, pattern: &KeyPattern, features: &PatternFeatures) -> Vec<PrefetchCandidate> {
        if features.sequentiality < self.threshold {
            return Vec::new();
        }
        let Some(last) = pattern.last() else {
            return Vec::new();
        };
        if last.length == 0 {
            return Vec::new();
        }
        (1..=self.lookahead as u64)
            .map(|step| PrefetchCandidate {
                fingerprint: RangeFingerprint::new(
                    last.key.clone(),
                    last.offset + step * last.length,
                    last.length,
                ),
                // Priority decays with projection distance.
                priority: 1.0 / step as f64,
            })
            .collect()
    }
}

/// Re-warms recently seen ranges of a hot key.
pub struct TemporalPredictor {
    pub frequency_threshold: f64,
    pub limit: usize,
}

impl TemporalPredictor {
    pub fn predict(&self, pattern: &KeyPattern, features: &PatternFeatures) -> Vec<PrefetchCandidate> {
        if features.frequency < self.frequency_threshold {
            return Vec::new();
        }
        let Some(last) = pattern.last() else {
            return Vec::new();
        };
        pattern
            .recent_ranges(self.limit)
            .into_iter()
            .enumerate()
            .map(|(i, (offset, length))| PrefetchCandidate {
                fingerprint: RangeFingerprint::new(last.key.clone(), offset, length),
                // Re-warm candidates rank below sequential projections.
                priority: 0.5 / (i + 1) as f64,
            })
            .collect()
    }
}

/// Online logistic model over the pattern features.
///
/// `predict` is a pure function of the current weights; updates are
/// serialized on the write lock, so readers never observe a half-updated
/// vector.
pub struct LearnedPredictor {
    weights: RwLock<ModelWeights>,
    learning_rate: f64,
    pub confidence_threshold: f64,
}

struct ModelWeights {
    by_feature: HashMap<&'static str, f64>,
    bias: f64,
}

impl LearnedPredictor {
    pub fn new(learning_rate: f64, confidence_threshold: f64) -> Self {
        Self {
            weights: RwLock::new(ModelWeights {
                by_feature: FEATURE_NAMES.iter().map(|&name| (name, 0.0)).collect(),
                bias: 0.0,
            }),
            learning_rate,
            confidence_threshold,
        }
    }

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    /// Probability that the next access continues sequentially.
    pub fn predict(&self, features: &PatternFeatures) -> f64 {
        let weights = self.weights.read();
        let x = features.as_vector();
        let mut logit = weights.bias;
        for (name, value) in FEATURE_NAMES.iter().zip(x) {
            logit += weights.by_feature[name] * value;
        }
        Self::sigmoid(logit)
    }

    /// One gradient step: `w <- w + eta * (y - y_hat) * x`.
    pub fn update(&self, features: &PatternFeatures, label: bool) {
        let x = features.as_vector();
        let y = if label { 1.0 } else { 0.0 };
        let y_hat = self.predict(features);
        let error = y - y_hat;

        let mut weights = self.weights.write();
        for (name, value) in FEATURE_NAMES.iter().zip(x) {
            let w = weights.by_feature.get_mut(name).expect("fixed feature table");
            *w += self.learning_rate * error * value;
        }
        weights.bias += self.learning_rate * error;
    }

    /// Emits one candidate at the next expected offset when confident.
    pub fn predict_candidate(
        &self,
        pattern: &KeyPattern,
        features: &PatternFeatures,
    ) -> Option<PrefetchCandidate> {
        let confidence = self.predict(features);
        if confidence < self.confidence_threshold {
            return None;
        }
        let last = pattern.last()?;
        if last.length == 0 {
            return None;
        }
        Some(PrefetchCandidate {
            fingerprint: RangeFingerprint::new(last.key.clone(), last.end(), last.length),
            priority: confidence,
        })
    }

    /// Snapshot of the small weight map, for introspection.
    pub fn weights(&self) -> HashMap<&'static str, f64> {
        self.weights.read().by_feature.clone()
    }
}

/// Union, sort by priority descending, dedupe by fingerprint, truncate.
pub fn merge_candidates(
    mut candidates: Vec<PrefetchCandidate>,
    limit: usize,
) -> Vec<PrefetchCandidate> {
    candidates.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for candidate in candidates {
        let key = candidate.fingerprint.cache_key();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(candidate);
        if out.len() >= limit {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AccessEvent;

    fn scan_pattern(events: usize, size: u64) -> KeyPattern {
        let mut pattern = KeyPattern::new(32);
        for i in 0..events as u64 {
            pattern.record(AccessEvent::new("k", i * size, size));
        }
        pattern
    }

    #[test]
    fn test_sequential_projection() {
        let pattern = scan_pattern(8, 4096);
        let predictor = SequentialPredictor {
            threshold: 0.7,
            lookahead: 3,
        };
        let features = pattern.features();
        let candidates = predictor.predict(&pattern, &features);
        assert_eq!(candidates.len(), 3);
        // Last access was offset 7*4096; first projection is 8*4096.
        assert_eq!(candidates[0].fingerprint.offset, 8 * 4096);
        assert_eq!(candidates[1].fingerprint.offset, 9 * 4096);
        assert!(candidates[0].priority > candidates[1].priority);
    }

    #[test]
    fn test_sequential_silent_below_threshold() {
        let mut pattern = KeyPattern::new(32);
        for offset in [0u64, 50_000, 3, 90_000] {
            pattern.record(AccessEvent::new("k", offset, 64));
        }
        let predictor = SequentialPredictor {
            threshold: 0.7,
            lookahead: 3,
        };
        let features = pattern.features();
        assert!(predictor.predict(&pattern, &features).is_empty());
    }

    #[test]
    fn test_temporal_rewarm() {
        let mut pattern = KeyPattern::new(32);
        for _ in 0..4 {
            pattern.record(AccessEvent::new("k", 0, 100));
            pattern.record(AccessEvent::new("k", 100, 100));
        }
        let predictor = TemporalPredictor {
            frequency_threshold: 0.0,
            limit: 4,
        };
        let features = pattern.features();
        let candidates = predictor.predict(&pattern, &features);
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.fingerprint.key == "k"));
    }

    #[test]
    fn test_learned_predictor_converges_on_sequential_workload() {
        let predictor = LearnedPredictor::new(0.5, 0.8);
        let pattern = scan_pattern(16, 4096);
        let features = pattern.features();

        let before = predictor.predict(&features);
        for _ in 0..200 {
            predictor.update(&features, true);
        }
        let after = predictor.predict(&features);
        assert!(after > before);
        assert!(after > 0.8);
        assert!(predictor.predict_candidate(&pattern, &features).is_some());
    }

    #[test]
    fn test_learned_predictor_learns_negative_labels() {
        let predictor = LearnedPredictor::new(0.5, 0.8);
        let pattern = scan_pattern(16, 4096);
        let features = pattern.features();
        for _ in 0..200 {
            predictor.update(&features, false);
        }
        assert!(predictor.predict(&features) < 0.2);
        assert!(predictor.predict_candidate(&pattern, &features).is_none());
    }

    #[test]
    fn test_merge_orders_dedupes_truncates() {
        let fp = |offset| RangeFingerprint::new("k", offset, 10);
        let candidates = vec![
            PrefetchCandidate { fingerprint: fp(10), priority: 0.3 },
            PrefetchCandidate { fingerprint: fp(20), priority: 0.9 },
            PrefetchCandidate { fingerprint: fp(10), priority: 0.8 },
            PrefetchCandidate { fingerprint: fp(30), priority: 0.5 },
        ];
        let merged = merge_candidates(candidates, 2);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].fingerprint.offset, 20);
        assert_eq!(merged[1].fingerprint.offset, 10);
        assert!((merged[1].priority - 0.8).abs() < f64::EPSILON);
    }
}
