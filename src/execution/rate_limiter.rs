//! Token-bucket throttle for outbound order traffic.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Async token bucket shared by every outbound submission.
///
/// Waiting happens outside the lock, so concurrent callers never exceed
/// the capacity.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Start with a full bucket.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Wait until `tokens` are available and take them.
    ///
    /// Requests above capacity are clamped to the capacity.
    pub async fn acquire(&self, tokens: f64) {
        let tokens = tokens.min(self.capacity);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= tokens {
                    bucket.tokens -= tokens;
                    return;
                }
                (tokens - bucket.tokens) / self.refill_per_sec
            };
            debug!(wait_ms = (wait * 1000.0) as u64, "Rate limited, waiting");
            sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Take `tokens` if available right now.
    pub async fn try_acquire(&self, tokens: f64) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= tokens {
            bucket.tokens -= tokens;
            true
        } else {
            false
        }
    }

    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_wait() {
        let limiter = RateLimiter::new(3.0, 2.0);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(1.0).await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));

        limiter.acquire(1.0).await;
        assert!(start.elapsed() >= Duration::from_millis(499));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_does_not_wait() {
        let limiter = RateLimiter::new(1.0, 1.0);
        assert!(limiter.try_acquire(1.0).await);
        assert!(!limiter.try_acquire(1.0).await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire(1.0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_respects_rate() {
        let limiter = Arc::new(RateLimiter::new(5.0, 5.0));
        let start = Instant::now();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire(1.0).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // 5 from the initial burst, 15 refilled at 5/s
        assert!(start.elapsed() >= Duration::from_millis(2_990));
        assert!(limiter.available().await < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let limiter = RateLimiter::new(2.0, 10.0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.available().await, 2.0);
    }
}
