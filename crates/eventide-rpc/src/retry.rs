//! Exponential backoff for transient RPC failures.
//!
//! Transient errors are retried without an attempt cap; the delay doubles
//! from `initial` up to `max` (60 s by default) and stays there.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before the `attempt`-th retry (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        // Clamp the exponent: past ~32 doublings the cap always wins and
        // `powi` would overflow to infinity anyway.
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(32) as i32);
        let ms = self.initial.as_millis() as f64 * exp;
        let capped = ms.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_initial() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn capped_at_max() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(30), Duration::from_secs(60));
        // No attempt cap: very late attempts still get the max delay.
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }
}
