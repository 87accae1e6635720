// # Token-Bucket Rate Limiter
//
// Byte-denominated token bucket bounding speculative fetch bandwidth.
// Capacity is one second of budget; tokens refill continuously from
// elapsed wall time. Denied requests are skipped, never queued.

use parking_lot::Mutex;
use std::time::Instant;

pub struct TokenBucket {
    state: Mutex<BucketState>,
    /// Tokens per second, also the bucket capacity.
    rate: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
            rate,
        }
    }

    /// Takes `n` tokens if available. A request larger than the whole
    /// bucket is granted when the bucket is full, going into debt, so a
    /// single oversized candidate cannot starve forever.
    pub fn try_acquire(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.last_refill = Instant::now();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);

        let needed = n as f64;
        if state.tokens >= needed || state.tokens >= self.rate {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (may be negative while in debt).
    pub fn available(&self) -> f64 {
        self.state.lock().tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_grants_up_to_capacity() {
        let bucket = TokenBucket::new(1000);
        assert!(bucket.try_acquire(600));
        assert!(bucket.try_acquire(400));
        assert!(!bucket.try_acquire(400));
    }

    #[test]
    fn test_refills_over_time() {
        let bucket = TokenBucket::new(10_000);
        assert!(bucket.try_acquire(10_000));
        assert!(!bucket.try_acquire(5_000));
        std::thread::sleep(Duration::from_millis(600));
        assert!(bucket.try_acquire(5_000));
    }

    #[test]
    fn test_oversized_request_from_full_bucket() {
        let bucket = TokenBucket::new(100);
        assert!(bucket.try_acquire(500));
        assert!(bucket.available() < 0.0);
        assert!(!bucket.try_acquire(1));
    }
}
