use crate::{
    BlockId, MappingPolicy, PageBlock, PagePoolDevice, PageRef, PagingError, Range,
    VirtualAddress,
};

/// Page-granular allocator for one memory tier.
///
/// Blocks are laid out back to back from `base_address` and created on
/// demand, as far as the policy allows. Every allocation made during a frame
/// is expected to be gone by the next `next_frame`, which simply resets all
/// blocks to fresh.
pub struct PageAllocator<P: MappingPolicy, D: PagePoolDevice> {
    policy: P,
    device: D,
    base_address: VirtualAddress,
    blocks: Vec<PageBlock>,
    /// Set when a block hands out pages; cleared by `clean`.
    touched: Vec<bool>,
    high_mark: usize,
    free_pages: u64,
}

impl<P: MappingPolicy, D: PagePoolDevice> PageAllocator<P, D> {
    pub fn new(device: D, base_address: VirtualAddress, budget_bytes: u64) -> Self {
        debug_assert!(P::BLOCK_PAGE_COUNT > 0, "block page count must be non-zero");
        debug_assert!(
            base_address.is_page_aligned(),
            "base address {base_address} is not page aligned"
        );
        Self {
            policy: P::new(budget_bytes),
            device,
            base_address,
            blocks: Vec::new(),
            touched: Vec::new(),
            high_mark: 0,
            free_pages: 0,
        }
    }

    #[inline]
    pub fn base_address(&self) -> VirtualAddress {
        self.base_address
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn blocks(&self) -> &[PageBlock] {
        &self.blocks
    }

    /// Pages currently free across all initialized blocks.
    #[inline]
    pub fn free_page_count(&self) -> u64 {
        self.free_pages
    }

    /// Pages across all initialized blocks.
    #[inline]
    pub fn capacity_pages(&self) -> u64 {
        self.blocks.len() as u64 * P::BLOCK_PAGE_COUNT as u64
    }

    /// Largest block count reached since construction or the last `clean`.
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.high_mark
    }

    #[inline]
    fn block_address(&self, index: usize) -> VirtualAddress {
        self.base_address.offset(P::BLOCK_SIZE_BYTES * index as u64)
    }

    /// Grow by one block if the policy allows it.
    fn expand(&mut self) -> Result<bool, PagingError> {
        let index = self.blocks.len();
        if !self.policy.can_expand(index + 1) {
            return Ok(false);
        }

        let address = self.block_address(index);
        let mut block = PageBlock::new(P::BLOCK_PAGE_COUNT);
        self.policy
            .init_block(&self.device, address, index, &mut block)?;
        debug_assert!(block.is_fresh(), "policy returned a block that is not fresh");

        self.blocks.push(block);
        self.touched.push(false);
        self.free_pages += P::BLOCK_PAGE_COUNT as u64;
        self.high_mark = self.high_mark.max(self.blocks.len());

        tracing::info!(
            tier = ?P::TIER,
            index,
            %address,
            pages = P::BLOCK_PAGE_COUNT,
            "page block initialized"
        );
        Ok(true)
    }

    /// Allocate `count` pages, appending one `PageRef` per granted range.
    ///
    /// Existing blocks are walked in creation order before the tier grows.
    /// Returns the number of pages that could not be satisfied; a non-zero
    /// remainder is not an error, the caller decides where it goes next.
    pub fn allocate(&mut self, count: u32, refs: &mut Vec<PageRef>) -> Result<u32, PagingError> {
        let mut remaining = count;
        let mut index = 0;

        while remaining > 0 {
            if index == self.blocks.len() && !self.expand()? {
                break;
            }

            let base_address = self.block_address(index);
            let block = &mut self.blocks[index];
            while remaining > 0 {
                let Some(range) = block.allocate_range(remaining) else {
                    break;
                };
                remaining -= range.count;
                self.free_pages -= range.count as u64;
                self.touched[index] = true;

                refs.push(PageRef {
                    base_address,
                    block_page_count: P::BLOCK_PAGE_COUNT,
                    block: BlockId::new(P::TIER, index as u32),
                    range,
                });
            }
            index += 1;
        }

        Ok(remaining)
    }

    /// Return every page in `refs` that belongs to this tier.
    pub fn release(&mut self, refs: &[PageRef]) -> Result<(), PagingError> {
        for page in refs.iter().filter(|page| page.tier() == P::TIER) {
            let index = page.block.index();
            let block_count = self.blocks.len();
            let block = self
                .blocks
                .get_mut(index as usize)
                .ok_or(PagingError::ForeignBlock {
                    tier: P::TIER,
                    index,
                    block_count,
                })?;
            block.free_range(page.range);
            self.free_pages += page.range.count as u64;
        }
        Ok(())
    }

    /// Reset every block to fully free.
    pub fn next_frame(&mut self) {
        self.free_pages = self.capacity_pages();
        self.blocks.iter_mut().for_each(PageBlock::reset);
    }

    /// Release trailing blocks that have not handed out a page since the
    /// previous `clean`. Returns how many blocks were released.
    ///
    /// Only trailing blocks are removed so block ids held by live `PageRef`s
    /// stay valid.
    pub fn clean(&mut self) -> Result<usize, PagingError> {
        let mut released = 0;
        while let Some(last) = self.blocks.len().checked_sub(1) {
            if self.touched[last] || !self.blocks[last].is_fresh() {
                break;
            }
            self.deinit_last()?;
            released += 1;
        }

        self.touched.iter_mut().for_each(|touched| *touched = false);
        self.high_mark = self.blocks.len();

        if released > 0 {
            tracing::info!(tier = ?P::TIER, released, remaining = self.blocks.len(), "cleaned idle page blocks");
        }
        Ok(released)
    }

    fn deinit_last(&mut self) -> Result<(), PagingError> {
        let index = self.blocks.len() - 1;
        let address = self.block_address(index);
        let mut block = self.blocks.remove(index);
        self.touched.pop();
        self.free_pages -= block.free_page_count() as u64;

        self.policy
            .deinit_block(&self.device, address, index, &mut block)?;
        tracing::info!(tier = ?P::TIER, index, %address, "page block released");
        Ok(())
    }

    /// Ranges of `refs` that originated from this tier.
    pub fn ranges_of(&self, refs: &[PageRef]) -> Vec<Range> {
        refs.iter()
            .filter(|page| page.tier() == P::TIER)
            .map(|page| page.range)
            .collect()
    }

    /// Release every block, newest first. Keeps going after a failure and
    /// reports the first one.
    pub fn uninitialize(&mut self) -> Result<(), PagingError> {
        let mut first_error = None;
        while !self.blocks.is_empty() {
            if let Err(err) = self.deinit_last() {
                first_error.get_or_insert(err);
            }
        }
        self.free_pages = 0;
        first_error.map_or(Ok(()), Err)
    }
}

impl<P: MappingPolicy, D: PagePoolDevice> Drop for PageAllocator<P, D> {
    fn drop(&mut self) {
        if let Err(err) = self.uninitialize() {
            tracing::error!(tier = ?P::TIER, error = %err, "failed to release page blocks");
        }
    }
}
