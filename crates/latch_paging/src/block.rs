use crate::{PoolHandle, Range};

/// One pool of pages with an ordered, coalesced list of free ranges.
///
/// The free list is kept sorted by start page and no two entries are ever
/// adjacent. Allocation always carves from the front of the first free
/// range, so a request may be satisfied only partially and the caller is
/// expected to ask again for the remainder.
#[derive(Debug)]
pub struct PageBlock {
    page_count: u32,
    pool: Option<PoolHandle>,
    free: Vec<Range>,
}

impl PageBlock {
    /// Create an uninitialized (exhausted, unbacked) block of `page_count` pages.
    pub fn new(page_count: u32) -> Self {
        debug_assert!(page_count > 0);
        Self {
            page_count,
            pool: None,
            free: Vec::new(),
        }
    }

    #[inline]
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Page pool backing this block, once a mapping policy has initialized it.
    #[inline]
    pub fn pool(&self) -> Option<PoolHandle> {
        self.pool
    }

    #[inline]
    pub fn set_pool(&mut self, pool: Option<PoolHandle>) {
        self.pool = pool;
    }

    #[inline]
    pub fn free_ranges(&self) -> &[Range] {
        &self.free
    }

    pub fn free_page_count(&self) -> u32 {
        self.free.iter().map(|range| range.count).sum()
    }

    /// Every page of the block is allocated.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.free.is_empty()
    }

    /// No page of the block is allocated.
    #[inline]
    pub fn is_fresh(&self) -> bool {
        self.free.len() == 1 && self.free[0].count == self.page_count
    }

    /// Take up to `count` pages from the front of the first free range.
    ///
    /// Returns `None` only when the block is exhausted (or `count` is zero).
    pub fn allocate_range(&mut self, count: u32) -> Option<Range> {
        if count == 0 {
            return None;
        }
        let first = self.free.first_mut()?;

        let taken = Range::new(first.start, count.min(first.count));
        first.start += taken.count;
        first.count -= taken.count;

        if first.count == 0 {
            self.free.remove(0);
        }
        Some(taken)
    }

    /// Return a range to the free list, coalescing with both neighbours.
    pub fn free_range(&mut self, range: Range) {
        debug_assert!(!range.is_empty());
        debug_assert!(
            range.end() <= self.page_count,
            "range {range:?} exceeds block of {} pages",
            self.page_count
        );

        let index = self
            .free
            .iter()
            .position(|existing| !existing.precedes(&range))
            .unwrap_or(self.free.len());

        let merged_left = index > 0 && Range::merge_left(&mut self.free[index - 1], &range);

        if index < self.free.len() {
            if merged_left {
                // The freed range may have closed the gap between both neighbours.
                let successor = self.free[index];
                if Range::merge_left(&mut self.free[index - 1], &successor) {
                    self.free.remove(index);
                }
                return;
            }
            if Range::merge_right(&range, &mut self.free[index]) {
                return;
            }
        }

        if !merged_left {
            self.free.insert(index, range);
        }
    }

    /// Collapse the free list to a single range spanning the whole block.
    pub fn reset(&mut self) {
        self.free.clear();
        self.free.push(Range::new(0, self.page_count));
    }

    /// Drop all free ranges and the pool binding (used when unbacking the block).
    pub fn clear(&mut self) {
        self.free.clear();
        self.pool = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn fresh(page_count: u32) -> PageBlock {
        let mut block = PageBlock::new(page_count);
        block.reset();
        block
    }

    fn assert_sorted_and_coalesced(block: &PageBlock) {
        for pair in block.free_ranges().windows(2) {
            assert!(pair[0].precedes(&pair[1]), "unsorted: {:?}", block.free_ranges());
            assert!(
                !Range::adjacent(&pair[0], &pair[1]),
                "uncoalesced: {:?}",
                block.free_ranges()
            );
        }
        assert!(block.free_ranges().iter().all(|range| range.count > 0));
    }

    #[test]
    fn new_block_is_exhausted_until_reset() {
        let mut block = PageBlock::new(8);
        assert!(block.is_exhausted());
        assert!(block.allocate_range(1).is_none());
        block.reset();
        assert!(block.is_fresh());
    }

    #[test]
    fn allocate_then_free_restores_block() {
        let mut block = fresh(100);

        let a = block.allocate_range(30).unwrap();
        let b = block.allocate_range(40).unwrap();
        assert_eq!(a, Range::new(0, 30));
        assert_eq!(b, Range::new(30, 40));
        assert_eq!(block.free_ranges(), &[Range::new(70, 30)]);

        block.free_range(a);
        assert_eq!(block.free_ranges(), &[Range::new(0, 30), Range::new(70, 30)]);

        block.free_range(b);
        assert_eq!(block.free_ranges(), &[Range::new(0, 100)]);
        assert!(block.is_fresh());
    }

    #[test]
    fn short_allocation_from_first_range() {
        let mut block = fresh(16);
        let a = block.allocate_range(4).unwrap();
        let _b = block.allocate_range(4).unwrap();
        block.free_range(a);

        // First free range only has four pages; caller must come back for the rest.
        assert_eq!(block.allocate_range(6), Some(Range::new(0, 4)));
        assert_eq!(block.allocate_range(2), Some(Range::new(8, 2)));
    }

    #[test]
    fn exhaustion() {
        let mut block = fresh(8);
        assert_eq!(block.allocate_range(20), Some(Range::new(0, 8)));
        assert!(block.is_exhausted());
        assert_eq!(block.allocate_range(1), None);
    }

    #[test]
    fn free_merges_right_only() {
        let mut block = fresh(10);
        let a = block.allocate_range(3).unwrap();
        let b = block.allocate_range(3).unwrap();
        let _c = block.allocate_range(4).unwrap();
        block.free_range(b);
        assert_eq!(block.free_ranges(), &[Range::new(3, 3)]);
        block.free_range(a);
        assert_eq!(block.free_ranges(), &[Range::new(0, 6)]);
    }

    #[test]
    fn free_into_gap_without_merging() {
        let mut block = fresh(12);
        let a = block.allocate_range(4).unwrap();
        let b = block.allocate_range(4).unwrap();
        let c = block.allocate_range(4).unwrap();
        block.free_range(a);
        block.free_range(c);
        assert_eq!(block.free_ranges(), &[Range::new(0, 4), Range::new(8, 4)]);
        block.free_range(b);
        assert!(block.is_fresh());
    }

    #[test]
    fn randomized_invariants_and_conservation() {
        const CAPACITY: u32 = 97;
        let mut rng = SmallRng::seed_from_u64(0x5eed_1a7c);

        for _ in 0..32 {
            let mut block = fresh(CAPACITY);
            let mut live: Vec<Range> = Vec::new();

            for _ in 0..400 {
                if live.is_empty() || rng.gen_bool(0.55) {
                    let want = rng.gen_range(1..=12);
                    if let Some(range) = block.allocate_range(want) {
                        assert!(range.count <= want);
                        live.push(range);
                    }
                } else {
                    let victim = live.swap_remove(rng.gen_range(0..live.len()));
                    block.free_range(victim);
                }

                assert_sorted_and_coalesced(&block);
                let allocated: u32 = live.iter().map(|range| range.count).sum();
                assert_eq!(block.free_page_count() + allocated, CAPACITY);
            }

            for range in live.drain(..) {
                block.free_range(range);
            }
            assert!(block.is_fresh());
        }
    }
}
