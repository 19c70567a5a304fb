//! Adaptive chunk sizing for `eth_getLogs` range fetches.
//!
//! Bisection on failure, cautious growth on success: halve when the node
//! reports the response would be too large, double after three consecutive
//! successes, never past the per-chain ceiling.

/// Initial chunk size in blocks.
pub const INITIAL_CHUNK_SIZE: u64 = 10_000;

const GROW_AFTER_SUCCESSES: u32 = 3;

#[derive(Debug)]
pub struct ChunkSizer {
    current: u64,
    ceiling: u64,
    successes: u32,
}

impl ChunkSizer {
    pub fn new(ceiling: u64) -> Self {
        Self {
            current: INITIAL_CHUNK_SIZE.min(ceiling.max(1)),
            ceiling: ceiling.max(1),
            successes: 0,
        }
    }

    /// Current chunk size in blocks.
    pub fn size(&self) -> u64 {
        self.current
    }

    /// The fetch succeeded; grow after three in a row.
    pub fn record_success(&mut self) {
        self.successes += 1;
        if self.successes >= GROW_AFTER_SUCCESSES && self.current < self.ceiling {
            self.current = (self.current * 2).min(self.ceiling);
            self.successes = 0;
        }
    }

    /// The node rejected the range as too large; bisect.
    pub fn record_too_large(&mut self) {
        self.current = (self.current / 2).max(1);
        self.successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_ten_thousand() {
        let sizer = ChunkSizer::new(100_000);
        assert_eq!(sizer.size(), 10_000);
    }

    #[test]
    fn halves_on_too_large() {
        let mut sizer = ChunkSizer::new(100_000);
        sizer.record_too_large();
        assert_eq!(sizer.size(), 5_000);
        sizer.record_too_large();
        assert_eq!(sizer.size(), 2_500);
    }

    #[test]
    fn floor_is_one_block() {
        let mut sizer = ChunkSizer::new(100_000);
        for _ in 0..40 {
            sizer.record_too_large();
        }
        assert_eq!(sizer.size(), 1);
    }

    #[test]
    fn doubles_after_three_successes_up_to_ceiling() {
        let mut sizer = ChunkSizer::new(25_000);
        for _ in 0..3 {
            sizer.record_success();
        }
        assert_eq!(sizer.size(), 20_000);
        for _ in 0..3 {
            sizer.record_success();
        }
        assert_eq!(sizer.size(), 25_000);
        for _ in 0..3 {
            sizer.record_success();
        }
        assert_eq!(sizer.size(), 25_000);
    }

    #[test]
    fn failure_resets_success_streak() {
        let mut sizer = ChunkSizer::new(100_000);
        sizer.record_success();
        sizer.record_success();
        sizer.record_too_large();
        assert_eq!(sizer.size(), 5_000);
        sizer.record_success();
        sizer.record_success();
        sizer.record_success();
        assert_eq!(sizer.size(), 10_000);
    }

    #[test]
    fn ceiling_caps_initial_size() {
        let sizer = ChunkSizer::new(2_000);
        assert_eq!(sizer.size(), 2_000);
    }
}
