//! Token bucket rate limiter
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct RateLimiter {
    capacity: u32,
    tokens: Arc<Mutex<u32>>,
    refill_period: Duration,
    last_refill: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    /// Bucket refilled to `capacity` once per second.
    pub fn per_second(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }

    /// Bucket refilled to `capacity` once per minute.
    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    pub fn new(capacity: u32, refill_period: Duration) -> Self {
        RateLimiter {
            capacity,
            tokens: Arc::new(Mutex::new(capacity)),
            refill_period,
            last_refill: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Try to acquire a token, returns true if successful.
    pub async fn try_acquire(&self) -> bool {
        self.refill().await;

        let mut tokens = self.tokens.lock().await;
        if *tokens > 0 {
            *tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then acquire it.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn refill(&self) {
        let mut last_refill = self.last_refill.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);

        if elapsed >= self.refill_period {
            let periods = (elapsed.as_secs_f64() / self.refill_period.as_secs_f64()) as u32;

            let mut tokens = self.tokens.lock().await;
            *tokens = tokens.saturating_add(periods.saturating_mul(self.capacity)).min(self.capacity);
            *last_refill = now;
        }
    }

    /// Get current available tokens.
    pub async fn available(&self) -> u32 {
        self.refill().await;
        let tokens = self.tokens.lock().await;
        *tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_exhausts_and_refills() {
        let limiter = RateLimiter::per_second(2);

        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_per_minute_bucket_does_not_refill_early() {
        let limiter = RateLimiter::per_minute(1);

        assert!(limiter.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!limiter.try_acquire().await);
    }
}
