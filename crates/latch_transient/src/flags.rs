use bitflags::bitflags;

bitflags! {
    /// Ways a transient resource may be bound to the pipeline.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct BindFlags: u32 {
        const SHADER_READ = 1 << 0;
        const UNORDERED_ACCESS = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
    }
}

bitflags! {
    /// Pipeline stages and caches to drain before aliased memory is rewritten.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct FlushFlags: u32 {
        /// Wait for in-flight pixel shader work.
        const PIXEL_SHADER = 1 << 0;
        /// Wait for in-flight compute shader work.
        const COMPUTE_SHADER = 1 << 1;
        /// Flush the color output path.
        const COLOR_DATA = 1 << 2;
        /// Flush the color compression metadata path.
        const COLOR_METADATA = 1 << 3;
        /// Flush the depth output path.
        const DEPTH_DATA = 1 << 4;
        /// Flush the depth compression metadata path.
        const DEPTH_METADATA = 1 << 5;
        /// Invalidate the shared texture read cache.
        const TEXTURE_CACHE_INVALIDATE = 1 << 6;
    }
}

/// Usage state a resource is in on the GPU timeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UsageState {
    Common,
    RenderTarget,
    DepthWrite,
    DepthRead,
    PixelShaderResource,
    NonPixelShaderResource,
    UnorderedAccess,
    CopySource,
    CopyDest,
    GenericRead,
}

impl UsageState {
    /// State a resource with `usage` rests in while it is not acquired.
    pub fn resting(usage: BindFlags) -> Self {
        if usage.contains(BindFlags::DEPTH_STENCIL) {
            UsageState::DepthWrite
        } else {
            UsageState::RenderTarget
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resting_state_follows_depth_usage() {
        assert_eq!(
            UsageState::resting(BindFlags::RENDER_TARGET | BindFlags::SHADER_READ),
            UsageState::RenderTarget
        );
        assert_eq!(
            UsageState::resting(BindFlags::DEPTH_STENCIL | BindFlags::SHADER_READ),
            UsageState::DepthWrite
        );
        assert_eq!(
            UsageState::resting(BindFlags::UNORDERED_ACCESS),
            UsageState::RenderTarget
        );
    }
}
