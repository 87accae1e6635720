// # Metrics Seam
//
// The narrow capability set the metrics collaborator implements. The
// core records against this trait; exporters (Prometheus and friends)
// live outside the data path.

use std::time::Duration;
use tracing::debug;

pub trait MetricsRecorder: Send + Sync {
    fn record_operation(&self, name: &'static str, duration: Duration);
    fn record_cache_hit(&self, level: &str);
    fn record_cache_miss(&self);
    fn record_error(&self, kind: &'static str);
}

/// Discards everything.
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_operation(&self, _name: &'static str, _duration: Duration) {}
    fn record_cache_hit(&self, _level: &str) {}
    fn record_cache_miss(&self) {}
    fn record_error(&self, _kind: &'static str) {}
}

/// Emits `tracing` debug events; useful in development.
pub struct TracingMetrics;

impl MetricsRecorder for TracingMetrics {
    fn record_operation(&self, name: &'static str, duration: Duration) {
        debug!(operation = name, ?duration, "operation recorded");
    }

    fn record_cache_hit(&self, level: &str) {
        debug!(level, "cache hit");
    }

    fn record_cache_miss(&self) {
        debug!("cache miss");
    }

    fn record_error(&self, kind: &'static str) {
        debug!(kind, "error recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    pub struct CountingMetrics {
        pub hits: Mutex<Vec<String>>,
        pub misses: Mutex<u64>,
    }

    impl MetricsRecorder for CountingMetrics {
        fn record_operation(&self, _name: &'static str, _duration: Duration) {}
        fn record_cache_hit(&self, level: &str) {
            self.hits.lock().push(level.to_string());
        }
        fn record_cache_miss(&self) {
            *self.misses.lock() += 1;
        }
        fn record_error(&self, _kind: &'static str) {}
    }

    #[test]
    fn test_recorder_object_safety() {
        let recorder: Arc<dyn MetricsRecorder> = Arc::new(CountingMetrics::default());
        recorder.record_cache_hit("memory");
        recorder.record_cache_miss();
    }
}
