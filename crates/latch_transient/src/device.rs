//! Device seams the transient allocator is driven through.

use crate::{
    FlushFlags, PageMappingCommand, ResourceLayout, TransientDesc, TransientError, UsageState,
    ViewHandle,
};
use latch_paging::{PagePoolDevice, VirtualAddress, FAST_TIER_SIZE_BYTES};
use std::fmt;

/// Capability probe result relevant to transient allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Bytes of fast memory the device exposes; zero if it has none.
    pub fast_tier_bytes: u64,
    /// Resources can be placed on reserved virtual ranges and backed by
    /// remapping pages.
    pub supports_page_mapping: bool,
}

impl DeviceCapabilities {
    /// Whether the device has enough fast memory for the whole fast tier.
    #[inline]
    pub fn has_fast_tier(&self) -> bool {
        self.fast_tier_bytes >= FAST_TIER_SIZE_BYTES
    }
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            fast_tier_bytes: 0,
            supports_page_mapping: true,
        }
    }
}

/// Kind of view created for a resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ViewKind {
    RenderTarget,
    DepthStencil,
    ShaderRead,
    UnorderedAccess,
}

/// Resource creation on top of the page pool services.
pub trait TransientDevice: PagePoolDevice {
    type Resource: Clone + fmt::Debug;

    /// Reserve `size_bytes` of page-aligned virtual address space with no
    /// physical backing.
    fn reserve_virtual_range(&self, size_bytes: u64) -> Result<VirtualAddress, TransientError>;

    fn release_virtual_range(&self, address: VirtualAddress, size_bytes: u64);

    /// Create a resource placed at `address`. Its memory stays unbacked until
    /// page mappings for it are submitted.
    fn create_placed_resource(
        &self,
        address: VirtualAddress,
        desc: &TransientDesc,
        layout: &ResourceLayout,
        initial_state: UsageState,
    ) -> Result<Self::Resource, TransientError>;

    fn create_view(
        &self,
        resource: &Self::Resource,
        desc: &TransientDesc,
        kind: ViewKind,
    ) -> Result<ViewHandle, TransientError>;

    fn destroy_resource(&self, resource: Self::Resource);

    fn set_debug_name(&self, resource: &Self::Resource, name: &str);
}

/// Command stream a frame is recorded into.
pub trait RecordingContext<R> {
    /// Wait for the given stages and flush or invalidate the given caches.
    fn flush_pipeline(&mut self, flags: FlushFlags);

    fn transition(&mut self, resource: &R, before: UsageState, after: UsageState);
}

/// Queue that recorded work and page mappings are submitted to.
pub trait SubmissionContext {
    /// Apply one pool's page mappings ahead of the recorded work.
    fn copy_page_mappings(&mut self, command: &PageMappingCommand<'_>)
        -> Result<(), TransientError>;
}
