use std::fmt;

/// Non-owning key of a cached transient resource.
///
/// Only meaningful during the frame it was handed out in; the frame stamp
/// lets the cache reject handles kept past `next_frame`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub descriptor_hash: u64,
    pub frame_stamp: u64,
    pub instance_index: usize,
}

impl ResourceHandle {
    pub const INVALID: Self = Self {
        descriptor_hash: u64::MAX,
        frame_stamp: u64::MAX,
        instance_index: usize::MAX,
    };

    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for ResourceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("<invalid>");
        }
        write!(
            f,
            "{:016x}#{}@{}",
            self.descriptor_hash, self.instance_index, self.frame_stamp
        )
    }
}

/// Opaque handle of a view created by the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ViewHandle(pub u64);

/// Views created for a resource, one per requested bind usage.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ResourceViews {
    pub render_target: Option<ViewHandle>,
    pub depth_stencil: Option<ViewHandle>,
    pub shader_read: Option<ViewHandle>,
    pub unordered_access: Option<ViewHandle>,
}

/// A transient resource lent out between `acquire` and `release`.
#[derive(Debug, Clone)]
pub struct TransientResource<R> {
    pub handle: ResourceHandle,
    pub resource: R,
    pub views: ResourceViews,
}

impl<R> From<&TransientResource<R>> for ResourceHandle {
    fn from(resource: &TransientResource<R>) -> Self {
        resource.handle
    }
}
