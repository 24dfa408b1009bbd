//! Latch Paging
//!
//! Page-granular allocation of GPU memory tiers:
//! - `Range` / `PageBlock`: coalescing free-list over one pool of pages
//! - `PageAllocator`: growable set of blocks for a single tier
//! - `MappingPolicy`: tier-specific expansion and physical backing
//!
//! Physical memory and page pool registration are reached through the
//! `PagePoolDevice` trait so the allocator never talks to a driver directly.

mod allocator;
mod block;
mod device;
mod error;
mod policy;
mod range;

#[cfg(test)]
mod test_device;

pub use allocator::PageAllocator;
pub use block::PageBlock;
pub use device::{PagePoolDevice, PhysicalPage, PoolHandle, VirtualAddress};
pub use error::PagingError;
pub use policy::{FastTierPolicy, MainTierPolicy, MappingPolicy, TierKind};
pub use range::Range;

/// Size of one page of physical memory (64 KiB large pages).
pub const PAGE_SIZE_BYTES: u64 = kibibytes(64);

/// Capacity of the fast tier (32 MiB).
pub const FAST_TIER_SIZE_BYTES: u64 = mebibytes(32);
pub const FAST_TIER_PAGE_COUNT: u32 = (FAST_TIER_SIZE_BYTES / PAGE_SIZE_BYTES) as u32;

/// Pages per main-tier block (4 MiB per block).
pub const MAIN_BLOCK_PAGE_COUNT: u32 = 64;

pub const fn kibibytes(value: u64) -> u64 {
    value * 1024
}

pub const fn mebibytes(value: u64) -> u64 {
    kibibytes(value * 1024)
}

#[inline]
pub const fn div_round_up(num: u64, denom: u64) -> u64 {
    (num + denom - 1) / denom
}

/// Number of pages needed to hold `size_bytes`.
#[inline]
pub const fn page_count(size_bytes: u64) -> u64 {
    div_round_up(size_bytes, PAGE_SIZE_BYTES)
}

/// Identifies a block within the allocator of a specific tier.
///
/// Format when packed: [1-bit tier | 31-bit block index]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    tier: TierKind,
    index: u32,
}

impl BlockId {
    const INDEX_BITS: u32 = 31;
    const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    pub const fn new(tier: TierKind, index: u32) -> Self {
        Self { tier, index }
    }

    #[inline]
    pub fn tier(&self) -> TierKind {
        self.tier
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn to_bits(&self) -> u32 {
        ((self.tier as u32) << Self::INDEX_BITS) | (self.index & Self::INDEX_MASK)
    }

    pub fn from_bits(bits: u32) -> Self {
        let tier = if bits >> Self::INDEX_BITS == 0 {
            TierKind::Fast
        } else {
            TierKind::Main
        };
        Self {
            tier,
            index: bits & Self::INDEX_MASK,
        }
    }
}

/// A granted allocation: a range of pages inside one block of one tier.
///
/// Owned by the caller until handed back to `PageAllocator::release`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageRef {
    /// Virtual address of the block (and of its page pool).
    pub base_address: VirtualAddress,
    /// Page capacity of the block's pool.
    pub block_page_count: u32,
    pub block: BlockId,
    pub range: Range,
}

impl PageRef {
    #[inline]
    pub fn tier(&self) -> TierKind {
        self.block.tier()
    }

    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.range.count as u64 * PAGE_SIZE_BYTES
    }
}
