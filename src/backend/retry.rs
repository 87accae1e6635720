// # Retrying Backend Decorator
//
// Wraps any `ObjectBackend` with a per-call deadline and a bounded retry
// budget for transient failures. `NotFound` and `Fatal` pass through on
// the first occurrence.

use super::{ObjectBackend, ObjectMeta};
use crate::error::{FsError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry budget for transient backend errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
    /// Per-attempt deadline.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        // Up to 25% jitter so a fleet of retries does not synchronize.
        let jitter = rand::rng().random_range(0.0..0.25);
        exp.mul_f64(1.0 + jitter)
    }
}

/// `ObjectBackend` decorator applying `RetryPolicy` to every call.
pub struct RetryingBackend<B: ObjectBackend> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: ObjectBackend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn run<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..self.policy.max_attempts {
            let result = match tokio::time::timeout(self.policy.request_timeout, f()).await {
                Ok(r) => r,
                Err(_) => Err(FsError::Timeout(format!(
                    "{} exceeded {:?}",
                    op, self.policy.request_timeout
                ))),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(op, attempt, ?delay, error = %e, "transient backend error, retrying");
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| FsError::Internal(format!("{}: retry budget empty", op))))
    }
}

#[async_trait]
impl<B: ObjectBackend> ObjectBackend for RetryingBackend<B> {
    async fn get(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.run("get", || self.inner.get(key, offset, len)).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.run("put", || self.inner.put(key, data.clone())).await
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.run("head", || self.inner.head(key)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.run("delete", || self.inner.delete(key)).await
    }

    async fn health(&self) -> Result<()> {
        self.run("health", || self.inner.health()).await
    }
}
