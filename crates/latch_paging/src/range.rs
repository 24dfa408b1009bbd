/// A `[start, start + count)` interval of page indices within a block.
///
/// Ranges that live in the same free list must be disjoint; the ordering
/// and adjacency helpers assert that in debug builds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Range {
    pub start: u32,
    pub count: u32,
}

impl Range {
    #[inline]
    pub const fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// One past the last page of the range.
    #[inline]
    pub const fn end(&self) -> u32 {
        self.start + self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// True if this range lies entirely before `subsequent`.
    #[inline]
    pub fn precedes(&self, subsequent: &Range) -> bool {
        debug_assert!(
            Range::disjoint(self, subsequent),
            "page ranges {self:?} and {subsequent:?} intersect"
        );
        self.end() <= subsequent.start
    }

    /// True if this range lies entirely after `precedent`.
    #[inline]
    pub fn succeeds(&self, precedent: &Range) -> bool {
        precedent.precedes(self)
    }

    /// Extend `left` by `right` if they touch. Returns whether a merge happened.
    pub fn merge_left(left: &mut Range, right: &Range) -> bool {
        debug_assert!(Range::disjoint(left, right));
        if left.end() == right.start {
            left.count += right.count;
            true
        } else {
            false
        }
    }

    /// Extend `right` backwards by `left` if they touch. Returns whether a merge happened.
    pub fn merge_right(left: &Range, right: &mut Range) -> bool {
        debug_assert!(Range::disjoint(left, right));
        if left.end() == right.start {
            right.start = left.start;
            right.count += left.count;
            true
        } else {
            false
        }
    }

    /// True if the ranges do not share any page.
    #[inline]
    pub fn disjoint(r0: &Range, r1: &Range) -> bool {
        r0.end() <= r1.start || r0.start >= r1.end()
    }

    /// True if `right` starts exactly where `left` ends.
    #[inline]
    pub fn adjacent(left: &Range, right: &Range) -> bool {
        debug_assert!(Range::disjoint(left, right));
        left.end() == right.start
    }

    #[inline]
    pub fn as_std(&self) -> std::ops::Range<u32> {
        self.start..self.end()
    }
}
