//! Transient resource descriptors and their physical layout.

use crate::{BindFlags, UsageState};
use latch_paging::{div_round_up, PAGE_SIZE_BYTES};
use std::hash::{BuildHasher, Hash, Hasher};
use wgpu::TextureFormat;
use xxhash_rust::xxh3::Xxh3Builder;

/// Bytes of compression metadata per byte of surface data, as a divisor.
const METADATA_RATIO: u64 = 64;

/// Optimized clear value baked into a render or depth target.
#[derive(Debug, Copy, Clone)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u8 },
}

impl ClearValue {
    fn bits(&self) -> (u8, [u32; 4]) {
        match *self {
            ClearValue::Color(rgba) => (0, rgba.map(f32::to_bits)),
            ClearValue::DepthStencil { depth, stencil } => {
                (1, [depth.to_bits(), stencil as u32, 0, 0])
            }
        }
    }
}

// Floats compare bitwise so descriptors can key a hash map.
impl PartialEq for ClearValue {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for ClearValue {}

impl Hash for ClearValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

/// Physical footprint of a transient resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResourceLayout {
    /// Page-aligned size of all planes.
    pub size_bytes: u64,
    pub page_count: u32,
    /// The surface carries a compression metadata plane.
    pub has_metadata: bool,
}

/// Description of a transient 2D texture.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransientDesc {
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub sample_quality: u32,
    pub format: TextureFormat,
    pub usage: BindFlags,
    pub clear: ClearValue,
}

impl TransientDesc {
    /// Single-sampled, single-mip texture with a zero clear value.
    pub fn new(width: u32, height: u32, format: TextureFormat, usage: BindFlags) -> Self {
        let clear = if format.is_depth_stencil_format() {
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            }
        } else {
            ClearValue::Color([0.0; 4])
        };
        Self {
            width,
            height,
            array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            sample_quality: 0,
            format,
            usage,
            clear,
        }
    }

    /// Render target that is later sampled.
    pub fn color_target(width: u32, height: u32, format: TextureFormat) -> Self {
        Self::new(
            width,
            height,
            format,
            BindFlags::RENDER_TARGET | BindFlags::SHADER_READ,
        )
    }

    /// Depth-stencil target.
    pub fn depth_target(width: u32, height: u32, format: TextureFormat) -> Self {
        debug_assert!(format.is_depth_stencil_format(), "{format:?} is not a depth format");
        Self::new(width, height, format, BindFlags::DEPTH_STENCIL)
    }

    pub fn with_usage(mut self, usage: BindFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_samples(mut self, count: u32, quality: u32) -> Self {
        self.sample_count = count;
        self.sample_quality = quality;
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_array_size(mut self, array_size: u32) -> Self {
        self.array_size = array_size;
        self
    }

    pub fn with_clear(mut self, clear: ClearValue) -> Self {
        self.clear = clear;
        self
    }

    /// Content hash used as the cache key.
    pub fn descriptor_hash(&self) -> u64 {
        let mut hasher = Xxh3Builder::new().build_hasher();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// State the resource rests in between acquisitions.
    #[inline]
    pub fn resting_state(&self) -> UsageState {
        UsageState::resting(self.usage)
    }

    /// Compute the page-aligned footprint of the resource.
    ///
    /// Every mip of every array slice and sample is laid out back to back
    /// in format blocks; render and depth targets add a metadata plane that
    /// starts on its own page.
    pub fn layout(&self) -> ResourceLayout {
        let (block_width, block_height) = self.format.block_dimensions();
        let block_bytes = block_size_bytes(self.format) as u64;

        let mut surface_bytes = 0u64;
        for level in 0..self.mip_levels.max(1) {
            // Levels past the last halving stay 1x1.
            let width = self.width.checked_shr(level).unwrap_or(0).max(1) as u64;
            let height = self.height.checked_shr(level).unwrap_or(0).max(1) as u64;
            let blocks_x = div_round_up(width, block_width as u64);
            let blocks_y = div_round_up(height, block_height as u64);
            surface_bytes += blocks_x * blocks_y * block_bytes;
        }
        surface_bytes *= self.array_size.max(1) as u64 * self.sample_count.max(1) as u64;

        let has_metadata = self
            .usage
            .intersects(BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL);

        let mut size_bytes = align_to_page(surface_bytes);
        if has_metadata {
            size_bytes += align_to_page(div_round_up(surface_bytes, METADATA_RATIO));
        }

        ResourceLayout {
            size_bytes,
            page_count: (size_bytes / PAGE_SIZE_BYTES) as u32,
            has_metadata,
        }
    }

    /// Pages needed to back the resource.
    #[inline]
    pub fn page_count(&self) -> u32 {
        self.layout().page_count
    }
}

#[inline]
fn align_to_page(bytes: u64) -> u64 {
    div_round_up(bytes.max(1), PAGE_SIZE_BYTES) * PAGE_SIZE_BYTES
}

/// Bytes per format block, including formats whose combined aspects have
/// no single copy size.
fn block_size_bytes(format: TextureFormat) -> u32 {
    format
        .block_copy_size(None)
        .unwrap_or(match format {
            TextureFormat::Depth24Plus | TextureFormat::Depth24PlusStencil8 => 4,
            TextureFormat::Depth32FloatStencil8 => 8,
            _ => 4,
        })
}
