//! Latch Transient Resources
//!
//! Frame-scoped allocator for short-lived GPU resources (intermediate
//! render targets, depth buffers, post-process scratch textures):
//! - Resources are placed page by page into a fast tier and a main tier
//! - Resource objects are cached and reused across frames
//! - Releasing a resource schedules the pipeline flush the next
//!   acquisition needs before it may write to the same pages
//!
//! Frame protocol:
//!
//! ```ignore
//! allocator.next_frame()?;
//!
//! let color = allocator.acquire_fast(&mut cmds, &color_desc, UsageState::RenderTarget, Some("color"))?;
//! let depth = allocator.acquire_main(&mut cmds, &depth_desc, UsageState::DepthWrite, Some("depth"))?;
//! // ... draws ...
//! allocator.release(&mut cmds, &depth, UsageState::DepthWrite)?;
//! let bloom = allocator.acquire(&mut cmds, &bloom_desc, UsageState::RenderTarget, &[TierToken::fast(64)], Some("bloom"))?;
//! // ... draws ...
//! allocator.release(&mut cmds, &bloom, UsageState::PixelShaderResource)?;
//! allocator.release(&mut cmds, &color, UsageState::PixelShaderResource)?;
//!
//! allocator.finalize(&mut queue)?; // before the recorded commands are submitted
//! ```

mod allocator;
mod cache;
mod config;
mod desc;
mod device;
mod error;
mod flags;
mod handle;
pub mod headless;
mod metrics;
mod staging;
mod token;

pub use allocator::{AllocatorStats, FrameState, TransientAllocator, MIN_BUDGET_BYTES};
pub use cache::{CachedResource, TransientCache};
pub use config::AllocatorConfig;
pub use desc::{ClearValue, ResourceLayout, TransientDesc};
pub use device::{
    DeviceCapabilities, RecordingContext, SubmissionContext, TransientDevice, ViewKind,
};
pub use error::TransientError;
pub use flags::{BindFlags, FlushFlags, UsageState};
pub use handle::{ResourceHandle, ResourceViews, TransientResource, ViewHandle};
pub use metrics::AllocatorMetrics;
pub use staging::{MappingStage, PageMappingBatch, PageMappingCommand, PageRangeEntry};
pub use token::TierToken;

pub use latch_paging::{PageRef, Range, TierKind, VirtualAddress, PAGE_SIZE_BYTES};
pub use wgpu::TextureFormat;
