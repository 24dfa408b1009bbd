//! Device-side operations the mapping policies rely on.

use crate::{PagingError, PAGE_SIZE_BYTES};
use std::fmt;

/// GPU-visible virtual address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE_BYTES == 0
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque handle to a page pool registered with the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PoolHandle(pub u64);

/// Opaque frame number of one committed physical page.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalPage(pub u64);

/// Physical memory and page pool services of a graphics device.
///
/// Implementations are cheap handles (like `wgpu::Device`) shared by both
/// tier allocators, so every method takes `&self`.
pub trait PagePoolDevice: Clone {
    /// Bind `page_count` pages of fast memory at `address`.
    fn map_fast_memory(&self, address: VirtualAddress, page_count: u32)
        -> Result<(), PagingError>;

    fn unmap_fast_memory(&self, address: VirtualAddress, page_count: u32)
        -> Result<(), PagingError>;

    /// Commit `page_count` physical pages of main memory.
    fn allocate_physical_pages(&self, page_count: u32) -> Result<Vec<PhysicalPage>, PagingError>;

    fn map_physical_pages(
        &self,
        address: VirtualAddress,
        pages: &[PhysicalPage],
    ) -> Result<(), PagingError>;

    /// Remove the physical backing of `size_bytes` starting at `address`.
    fn decommit(&self, address: VirtualAddress, size_bytes: u64);

    fn free_physical_pages(&self, pages: Vec<PhysicalPage>);

    /// Register the pages at `address` as a pool resources can be mapped from.
    fn register_page_pool(
        &self,
        address: VirtualAddress,
        page_count: u32,
    ) -> Result<PoolHandle, PagingError>;

    fn unregister_page_pool(&self, pool: PoolHandle);
}
