// # Prefetch Engine
//
// Consumes the cache's access-event stream, maintains the bounded
// pattern table, trains the learned predictor, and executes prefetch
// jobs on a bounded worker pool behind the bandwidth limiter.

use super::pattern::KeyPattern;
use super::predictor::{
    merge_candidates, LearnedPredictor, PrefetchJob, SequentialPredictor, TemporalPredictor,
};
use super::rate_limit::TokenBucket;
use super::PrefetchConfig;
use crate::backend::ObjectBackend;
use crate::cache::{PutOrigin, TieredCache};
use crate::common::{AccessEvent, BoundedLruMap};
use crate::error::{FsError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Prefetcher statistics. `efficiency` is hits over hits plus waste.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefetchStats {
    pub predictions_total: u64,
    pub predictions_correct: u64,
    pub prefetch_requests: u64,
    pub prefetch_hits: u64,
    pub prefetch_waste: u64,
    pub jobs_queued: u64,
    pub jobs_completed: u64,
    pub jobs_dropped: u64,
    pub bytes_fetched: u64,
    pub throttled: u64,
    pub efficiency: f64,
}

struct PrefetcherCore {
    config: PrefetchConfig,
    cache: Arc<TieredCache>,
    backend: Arc<dyn ObjectBackend>,
    patterns: RwLock<BoundedLruMap<String, KeyPattern>>,
    learned: LearnedPredictor,
    sequential: SequentialPredictor,
    temporal: TemporalPredictor,
    limiter: TokenBucket,
    job_tx: mpsc::Sender<PrefetchJob>,
    enabled: AtomicBool,
    predictions_total: AtomicU64,
    prefetch_requests: AtomicU64,
    jobs_queued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_dropped: AtomicU64,
    bytes_fetched: AtomicU64,
    throttled: AtomicU64,
}

impl PrefetcherCore {
    fn handle_event(&self, event: AccessEvent) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }

        // Speculative fills report like any other put, but feeding them
        // into the pattern would let the prefetcher reinforce its own
        // guesses. Reads of prefetched entries (hits) are real demand
        // and still count.
        if event.was_prefetch_origin && !event.was_hit {
            return;
        }

        let key = event.key.clone();
        let mut patterns = self.patterns.write();
        if !patterns.contains_key(&key) {
            patterns.insert(key.clone(), KeyPattern::new(self.config.window_size));
        }
        let pattern = patterns.get_mut(&key).expect("pattern just inserted");

        // A miss and its fill report the same range back to back; the
        // second sighting carries no new signal.
        if let Some(last) = pattern.last() {
            if last.offset == event.offset && last.length == event.length {
                return;
            }
        }

        // Label the previous event's features now that its successor is
        // known: positive iff this access continued the scan.
        let label = pattern.continues_sequentially(&event);
        pattern.record(event);
        if let Some(features) = pattern.last_features {
            self.learned.update(&features, label);
        }

        let features = pattern.features();
        let mut candidates = self.sequential.predict(pattern, &features);
        candidates.extend(self.temporal.predict(pattern, &features));
        if let Some(candidate) = self.learned.predict_candidate(pattern, &features) {
            candidates.push(candidate);
        }
        drop(patterns);

        let candidates = merge_candidates(candidates, self.config.prefetch_ahead);
        if candidates.is_empty() {
            return;
        }

        self.predictions_total
            .fetch_add(candidates.len() as u64, Ordering::Relaxed);
        let job = PrefetchJob {
            candidates,
            deadline: Instant::now() + self.config.candidate_timeout,
        };
        match self.job_tx.try_send(job) {
            Ok(()) => {
                self.jobs_queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.jobs_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn execute_job(&self, job: PrefetchJob) {
        if Instant::now() > job.deadline {
            self.jobs_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for candidate in &job.candidates {
            let fp = &candidate.fingerprint;
            if self.cache.contains(fp) {
                continue;
            }
            if !self.limiter.try_acquire(fp.length) {
                self.throttled.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.prefetch_requests.fetch_add(1, Ordering::Relaxed);
            let fetch = self.backend.get(&fp.key, fp.offset, fp.length);
            match tokio::time::timeout(self.config.candidate_timeout, fetch).await {
                Ok(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    self.bytes_fetched
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    let _ = self
                        .cache
                        .put(&fp.key, fp.offset, &bytes, PutOrigin::Prefetch);
                }
                // Speculative fetches are best-effort; failures only feed
                // the stats.
                Ok(Err(e)) => {
                    debug!(fingerprint = %fp, error = %e, "prefetch fetch failed");
                }
                Err(_) => {
                    debug!(fingerprint = %fp, "prefetch fetch timed out");
                }
            }
        }
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// The prefetcher: event loop plus a bounded fetch worker pool.
pub struct Prefetcher {
    core: Arc<PrefetcherCore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Prefetcher {
    /// Spawns the event loop and worker pool. `events` is the receiver
    /// obtained from `TieredCache::subscribe_access_events`.
    pub fn start(
        config: PrefetchConfig,
        cache: Arc<TieredCache>,
        backend: Arc<dyn ObjectBackend>,
        mut events: mpsc::Receiver<AccessEvent>,
    ) -> Result<Self> {
        let violations = config.violations();
        if !violations.is_empty() {
            return Err(FsError::Configuration(violations.join("; ")));
        }

        let (job_tx, job_rx) = mpsc::channel(config.job_queue_depth);
        let core = Arc::new(PrefetcherCore {
            patterns: RwLock::new(BoundedLruMap::new(config.max_tracked_keys)),
            learned: LearnedPredictor::new(config.learning_rate, config.confidence_threshold),
            sequential: SequentialPredictor {
                threshold: config.sequential_threshold,
                lookahead: config.prefetch_ahead,
            },
            temporal: TemporalPredictor {
                frequency_threshold: config.frequency_threshold,
                limit: config.prefetch_ahead,
            },
            limiter: TokenBucket::new(config.bandwidth_bytes_per_sec),
            job_tx,
            enabled: AtomicBool::new(config.enabled),
            predictions_total: AtomicU64::new(0),
            prefetch_requests: AtomicU64::new(0),
            jobs_queued: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_dropped: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            config,
            cache,
            backend,
        });

        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        // Event loop.
        {
            let core = Arc::clone(&core);
            let mut rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(event) => core.handle_event(event),
                            None => break,
                        },
                        _ = rx.changed() => break,
                    }
                }
            }));
        }

        // Fetch workers share one receiver.
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        for _ in 0..core.config.max_concurrent_fetch {
            let core = Arc::clone(&core);
            let job_rx = Arc::clone(&job_rx);
            let mut rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = job_rx.lock().await;
                        tokio::select! {
                            job = guard.recv() => job,
                            _ = rx.changed() => None,
                        }
                    };
                    match job {
                        Some(job) => core.execute_job(job).await,
                        None => break,
                    }
                }
            }));
        }

        Ok(Self {
            core,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.core.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Number of keys currently tracked in the pattern table.
    pub fn tracked_keys(&self) -> usize {
        self.core.patterns.read().len()
    }

    pub fn stats(&self) -> PrefetchStats {
        let hits = self.core.cache.prefetch_hits();
        let waste = self.core.cache.prefetch_waste();
        let denominator = hits + waste;
        PrefetchStats {
            predictions_total: self.core.predictions_total.load(Ordering::Relaxed),
            predictions_correct: hits,
            prefetch_requests: self.core.prefetch_requests.load(Ordering::Relaxed),
            prefetch_hits: hits,
            prefetch_waste: waste,
            jobs_queued: self.core.jobs_queued.load(Ordering::Relaxed),
            jobs_completed: self.core.jobs_completed.load(Ordering::Relaxed),
            jobs_dropped: self.core.jobs_dropped.load(Ordering::Relaxed),
            bytes_fetched: self.core.bytes_fetched.load(Ordering::Relaxed),
            throttled: self.core.throttled.load(Ordering::Relaxed),
            efficiency: if denominator == 0 {
                0.0
            } else {
                hits as f64 / denominator as f64
            },
        }
    }

    /// Stops the event loop and workers; exits within one queue round.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        futures::future::join_all(tasks).await;
    }
}
