//! Token bucket rate limiter shared by every outbound Google API call.
//!
//! Classroom and Drive both enforce per-user request quotas. Callers wait on
//! [`RateLimiter::acquire`] before each request rather than failing when the
//! bucket is empty.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::trace;

/// Default sustained request rate.
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 10.0;

/// Default burst capacity.
pub const DEFAULT_BURST: f64 = 20.0;

#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    total_acquired: u64,
}

impl BucketState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_SECOND, DEFAULT_BURST)
    }
}

impl RateLimiter {
    /// Create a limiter refilling `requests_per_second` up to `burst` tokens.
    pub fn new(requests_per_second: f64, burst: f64) -> Self {
        let refill_rate = requests_per_second.max(f64::MIN_POSITIVE);
        let capacity = burst.max(1.0);
        Self {
            inner: Mutex::new(BucketState {
                available: capacity,
                capacity,
                refill_rate,
                last_refill: Instant::now(),
                total_acquired: 0,
            }),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(f64::MAX, f64::MAX)
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.inner.lock().await;
                state.refill();

                if state.available >= 1.0 {
                    state.available -= 1.0;
                    state.total_acquired += 1;
                    return;
                }

                let deficit = 1.0 - state.available;
                Duration::from_secs_f64(deficit / state.refill_rate)
            };

            // Sleep outside the lock so other callers can refill and proceed.
            trace!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Total tokens handed out so far.
    pub async fn total_acquired(&self) -> u64 {
        self.inner.lock().await.total_acquired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_is_immediate() {
        let limiter = RateLimiter::new(1.0, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(limiter.total_acquired().await, 5);
    }

    #[tokio::test]
    async fn test_empty_bucket_waits() {
        let limiter = RateLimiter::new(20.0, 1.0);
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        // One token at 20/s takes ~50ms to refill.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
