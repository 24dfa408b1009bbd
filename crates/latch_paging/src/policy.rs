//! Tier-specific behaviour plugged into `PageAllocator`.

use crate::{
    PageBlock, PagePoolDevice, PagingError, PhysicalPage, VirtualAddress, FAST_TIER_PAGE_COUNT,
    MAIN_BLOCK_PAGE_COUNT, PAGE_SIZE_BYTES,
};

/// Physical memory tier a page was taken from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TierKind {
    /// Small, fast, capacity-constrained memory.
    Fast = 0,
    /// Large, general-purpose memory that can grow block by block.
    Main = 1,
}

/// Supplies how a tier grows and how its blocks are physically backed.
///
/// Resolved statically: `PageAllocator` is generic over the policy, there is
/// no dynamic dispatch on the allocation path.
pub trait MappingPolicy {
    /// Tier recorded in every `BlockId` this policy hands out.
    const TIER: TierKind;
    /// Pages per block.
    const BLOCK_PAGE_COUNT: u32;
    /// Bytes per block.
    const BLOCK_SIZE_BYTES: u64 = Self::BLOCK_PAGE_COUNT as u64 * PAGE_SIZE_BYTES;

    /// Create the policy for a tier budget in bytes.
    fn new(budget_bytes: u64) -> Self;

    /// Whether the allocator may grow to `new_block_count` blocks.
    fn can_expand(&self, new_block_count: usize) -> bool;

    /// Back the block at `address` with physical memory and register its pool.
    /// On success the block must be fresh.
    fn init_block<D: PagePoolDevice>(
        &mut self,
        device: &D,
        address: VirtualAddress,
        index: usize,
        block: &mut PageBlock,
    ) -> Result<(), PagingError>;

    /// Undo `init_block`.
    fn deinit_block<D: PagePoolDevice>(
        &mut self,
        device: &D,
        address: VirtualAddress,
        index: usize,
        block: &mut PageBlock,
    ) -> Result<(), PagingError>;
}

/// Maps the whole fast tier as a single block.
#[derive(Debug)]
pub struct FastTierPolicy {
    enabled: bool,
}

impl MappingPolicy for FastTierPolicy {
    const TIER: TierKind = TierKind::Fast;
    const BLOCK_PAGE_COUNT: u32 = FAST_TIER_PAGE_COUNT;

    fn new(budget_bytes: u64) -> Self {
        Self {
            enabled: budget_bytes > 0,
        }
    }

    fn can_expand(&self, new_block_count: usize) -> bool {
        self.enabled && new_block_count == 1
    }

    fn init_block<D: PagePoolDevice>(
        &mut self,
        device: &D,
        address: VirtualAddress,
        _index: usize,
        block: &mut PageBlock,
    ) -> Result<(), PagingError> {
        device.map_fast_memory(address, Self::BLOCK_PAGE_COUNT)?;

        let pool = match device.register_page_pool(address, Self::BLOCK_PAGE_COUNT) {
            Ok(pool) => pool,
            Err(err) => {
                if let Err(unmap) = device.unmap_fast_memory(address, Self::BLOCK_PAGE_COUNT) {
                    tracing::warn!(
                        %address,
                        error = %unmap,
                        "failed to unmap fast tier after pool registration failed"
                    );
                }
                return Err(err);
            }
        };

        block.set_pool(Some(pool));
        block.reset();
        Ok(())
    }

    fn deinit_block<D: PagePoolDevice>(
        &mut self,
        device: &D,
        address: VirtualAddress,
        _index: usize,
        block: &mut PageBlock,
    ) -> Result<(), PagingError> {
        if let Some(pool) = block.pool() {
            device.unregister_page_pool(pool);
        }
        block.clear();
        device.unmap_fast_memory(address, Self::BLOCK_PAGE_COUNT)
    }
}

/// Commits main memory one block at a time, up to the tier budget.
#[derive(Debug)]
pub struct MainTierPolicy {
    max_size_bytes: u64,
    /// Physical pages committed for each block, indexed by block.
    committed: Vec<Vec<PhysicalPage>>,
}

impl MappingPolicy for MainTierPolicy {
    const TIER: TierKind = TierKind::Main;
    const BLOCK_PAGE_COUNT: u32 = MAIN_BLOCK_PAGE_COUNT;

    fn new(budget_bytes: u64) -> Self {
        Self {
            max_size_bytes: budget_bytes,
            committed: Vec::new(),
        }
    }

    fn can_expand(&self, new_block_count: usize) -> bool {
        Self::BLOCK_SIZE_BYTES * new_block_count as u64 <= self.max_size_bytes
    }

    fn init_block<D: PagePoolDevice>(
        &mut self,
        device: &D,
        address: VirtualAddress,
        index: usize,
        block: &mut PageBlock,
    ) -> Result<(), PagingError> {
        let pages = device.allocate_physical_pages(Self::BLOCK_PAGE_COUNT)?;

        if let Err(err) = device.map_physical_pages(address, &pages) {
            device.free_physical_pages(pages);
            return Err(err);
        }

        let pool = match device.register_page_pool(address, Self::BLOCK_PAGE_COUNT) {
            Ok(pool) => pool,
            Err(err) => {
                device.decommit(address, Self::BLOCK_SIZE_BYTES);
                device.free_physical_pages(pages);
                return Err(err);
            }
        };

        if self.committed.len() <= index {
            self.committed.resize_with(index + 1, Vec::new);
        }
        self.committed[index] = pages;

        block.set_pool(Some(pool));
        block.reset();
        Ok(())
    }

    fn deinit_block<D: PagePoolDevice>(
        &mut self,
        device: &D,
        address: VirtualAddress,
        index: usize,
        block: &mut PageBlock,
    ) -> Result<(), PagingError> {
        if let Some(pool) = block.pool() {
            device.unregister_page_pool(pool);
        }
        block.clear();

        device.decommit(address, Self::BLOCK_SIZE_BYTES);
        if let Some(pages) = self.committed.get_mut(index) {
            device.free_physical_pages(std::mem::take(pages));
        }
        Ok(())
    }
}
