//! Closed block-range set algebra.
//!
//! The sync cache records which block ranges have already been fetched per
//! `(chain, fingerprint)`; the historical planner subtracts those ranges
//! from the requested span to find what is still missing. Ranges are
//! inclusive on both ends and adjoining ranges merge (`[a,b]` + `[b+1,c]`
//! collapses to `[a,c]`).

use serde::{Deserialize, Serialize};

/// An inclusive block range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range [{start}, {end}]");
        Self { start, end }
    }

    /// Number of blocks covered; a closed range always covers at least one.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, block: u64) -> bool {
        self.start <= block && block <= self.end
    }

    /// Returns `true` if the ranges overlap or touch (`[1,5]` and `[6,9]` touch).
    fn mergeable(&self, other: &BlockRange) -> bool {
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }
}

/// An ordered set of disjoint, non-adjacent inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<BlockRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(iter: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut set = Self::new();
        for (start, end) in iter {
            set.insert(BlockRange::new(start, end));
        }
        set
    }

    /// Insert a range, merging with any overlapping or adjoining ranges.
    pub fn insert(&mut self, range: BlockRange) {
        let mut merged = range;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for r in &self.ranges {
            if r.mergeable(&merged) {
                merged = BlockRange::new(merged.start.min(r.start), merged.end.max(r.end));
            } else if r.end < merged.start {
                out.push(*r);
            } else {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(*r);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// Ranges of `span` not covered by this set, in ascending order.
    pub fn subtract_from(&self, span: BlockRange) -> Vec<BlockRange> {
        let mut missing = Vec::new();
        let mut cursor = span.start;

        for r in &self.ranges {
            if r.end < cursor {
                continue;
            }
            if r.start > span.end {
                break;
            }
            if r.start > cursor {
                missing.push(BlockRange::new(cursor, (r.start - 1).min(span.end)));
            }
            cursor = cursor.max(r.end.saturating_add(1));
            if cursor > span.end {
                return missing;
            }
        }
        if cursor <= span.end {
            missing.push(BlockRange::new(cursor, span.end));
        }
        missing
    }

    /// Returns `true` if every block of `span` is covered.
    pub fn covers(&self, span: BlockRange) -> bool {
        self.subtract_from(span).is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockRange> {
        self.ranges.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u64, u64)]) -> RangeSet {
        RangeSet::from_ranges(ranges.iter().copied())
    }

    #[test]
    fn insert_disjoint_keeps_order() {
        let s = set(&[(50, 60), (10, 20)]);
        let got: Vec<_> = s.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(got, vec![(10, 20), (50, 60)]);
    }

    #[test]
    fn insert_merges_overlap() {
        let s = set(&[(10, 20), (15, 30)]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.iter().next().unwrap(), &BlockRange::new(10, 30));
    }

    #[test]
    fn insert_merges_adjoining() {
        // [a,b] + [b+1,c] collapses
        let s = set(&[(10, 20), (21, 30)]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.iter().next().unwrap(), &BlockRange::new(10, 30));
    }

    #[test]
    fn insert_bridges_multiple() {
        let s = set(&[(10, 20), (40, 50), (21, 39)]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.iter().next().unwrap(), &BlockRange::new(10, 50));
    }

    #[test]
    fn subtract_finds_gaps() {
        let s = set(&[(100, 120), (150, 160)]);
        let missing = s.subtract_from(BlockRange::new(90, 200));
        assert_eq!(
            missing,
            vec![
                BlockRange::new(90, 99),
                BlockRange::new(121, 149),
                BlockRange::new(161, 200),
            ]
        );
    }

    #[test]
    fn subtract_from_empty_set() {
        let s = RangeSet::new();
        let missing = s.subtract_from(BlockRange::new(100, 102));
        assert_eq!(missing, vec![BlockRange::new(100, 102)]);
    }

    #[test]
    fn subtract_fully_covered() {
        let s = set(&[(0, 1000)]);
        assert!(s.subtract_from(BlockRange::new(100, 200)).is_empty());
        assert!(s.covers(BlockRange::new(100, 200)));
    }

    #[test]
    fn subtract_partial_edges() {
        let s = set(&[(100, 150)]);
        let missing = s.subtract_from(BlockRange::new(120, 180));
        assert_eq!(missing, vec![BlockRange::new(151, 180)]);
    }

    #[test]
    fn range_len() {
        assert_eq!(BlockRange::new(5, 5).len(), 1);
        assert_eq!(BlockRange::new(100, 109).len(), 10);
    }
}
