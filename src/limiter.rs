use std::sync::Mutex;

use tokio::time::Instant;

/// Token-bucket rate limiter.
///
/// Tokens refill continuously at `rate` per second up to `burst`; a request
/// is admitted when at least one whole token is available. Denied requests
/// carry no penalty.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: usize) -> Self {
        Self {
            rate,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Returns whether one request may proceed, consuming a token if so.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_bounded() {
        let limiter = RateLimiter::new(10.0, 20);
        for i in 0..20 {
            assert!(limiter.allow(), "request {i} within burst was denied");
        }
        // 21st request in the same instant is denied
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_one_token_per_period() {
        let limiter = RateLimiter::new(10.0, 20);
        for _ in 0..20 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());

        // at 10 tokens/s, 100ms buys exactly one token
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_clamps_at_burst() {
        let limiter = RateLimiter::new(10.0, 20);
        tokio::time::advance(Duration::from_secs(3600)).await;
        for _ in 0..20 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
    }
}
