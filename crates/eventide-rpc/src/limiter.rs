//! Token bucket rate limiter.
//!
//! Tokens accrue at `refill_per_second` up to `capacity`; each request
//! consumes one token. `acquire` suspends until a token is available, so
//! callers are paced without busy-waiting.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A bucket refilled at `per_second`, with one second of burst
    /// capacity.
    pub fn per_second(per_second: u32) -> Self {
        let rate = f64::from(per_second.max(1));
        Self {
            capacity: rate,
            refill_per_second: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, suspending until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token without waiting; `false` when the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_within_capacity() {
        let bucket = TokenBucket::per_second(10);
        for _ in 0..10 {
            assert!(bucket.try_acquire(), "should succeed within capacity");
        }
        assert!(!bucket.try_acquire(), "11th immediate request is limited");
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::per_second(100);
        // Drain the burst capacity.
        while bucket.try_acquire() {}

        let before = Instant::now();
        bucket.acquire().await;
        // 100/s refill → roughly 10ms for one token.
        assert!(before.elapsed() >= Duration::from_millis(5));
    }
}
