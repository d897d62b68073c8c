//! Token-bucket limiter for REST requests

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Requests-per-minute ceiling shared by one connector's REST calls
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `0` disables limiting
    pub fn per_minute(limit: u32) -> Self {
        let capacity = f64::from(limit);
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.capacity <= 0.0
    }

    /// Wait until a request slot is free
    pub async fn acquire(&self) {
        if self.is_unlimited() {
            return;
        }

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a slot without waiting
    pub async fn try_acquire(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_up_to_capacity() {
        let limiter = RateLimiter::per_minute(3);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
    }

    #[test]
    fn test_unlimited() {
        let limiter = RateLimiter::per_minute(0);
        assert!(limiter.is_unlimited());
        tokio_test::block_on(async {
            for _ in 0..1000 {
                assert!(limiter.try_acquire().await);
            }
            limiter.acquire().await;
        });
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        // 6000/min refills one token every 10ms
        let limiter = RateLimiter::per_minute(6000);
        for _ in 0..6000 {
            assert!(limiter.try_acquire().await);
        }
        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
