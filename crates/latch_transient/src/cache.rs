use crate::{
    BindFlags, ResourceHandle, ResourceLayout, ResourceViews, TransientDesc, TransientDevice,
    TransientError, ViewKind,
};
use latch_paging::{PageRef, VirtualAddress};
use std::collections::HashMap;

/// A resource object kept alive across frames.
///
/// Only its page mapping changes between uses; the object, its address
/// reservation and its views live until the cache is torn down.
#[derive(Debug)]
pub struct CachedResource<R> {
    pub desc: TransientDesc,
    pub layout: ResourceLayout,
    /// Start of the virtual range the resource is placed on.
    pub address: VirtualAddress,
    pub resource: R,
    pub views: ResourceViews,
    /// Frame the instance was last claimed in.
    pub frame_stamp: u64,
    /// Pages backing the resource since its last acquisition.
    pub pages: Vec<PageRef>,
    pub(crate) acquired: bool,
}

impl<R> CachedResource<R> {
    #[inline]
    pub fn page_count(&self) -> u32 {
        self.layout.page_count
    }

    #[inline]
    pub fn has_metadata(&self) -> bool {
        self.layout.has_metadata
    }

    /// Acquired and not yet released.
    #[inline]
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }
}

/// Descriptor-keyed cache of transient resource objects.
///
/// A bucket holds every instance created for one descriptor hash. Within a
/// frame each instance is handed out at most once, so asking for the same
/// shape twice yields two instances. Buckets compare full descriptors, so a
/// hash collision only shares a bucket.
pub struct TransientCache<D: TransientDevice> {
    device: D,
    buckets: HashMap<u64, Vec<CachedResource<D::Resource>>>,
    frame_stamp: u64,
    instance_count: usize,
}

impl<D: TransientDevice> TransientCache<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            buckets: HashMap::new(),
            frame_stamp: 0,
            instance_count: 0,
        }
    }

    #[inline]
    pub fn frame_stamp(&self) -> u64 {
        self.frame_stamp
    }

    #[inline]
    pub fn instance_count(&self) -> usize {
        self.instance_count
    }

    /// Claim an instance matching `desc` for this frame, creating one if
    /// every existing instance is already in use.
    pub fn create(&mut self, desc: &TransientDesc) -> Result<ResourceHandle, TransientError> {
        if desc.usage.is_empty() {
            return Err(TransientError::NoUsage);
        }

        let descriptor_hash = desc.descriptor_hash();
        let frame_stamp = self.frame_stamp;
        let bucket = self.buckets.entry(descriptor_hash).or_default();

        let reusable = bucket
            .iter()
            .position(|instance| instance.desc == *desc && instance.frame_stamp < frame_stamp);
        if let Some(instance_index) = reusable {
            let instance = &mut bucket[instance_index];
            instance.frame_stamp = frame_stamp;
            instance.pages.clear();
            return Ok(ResourceHandle {
                descriptor_hash,
                frame_stamp,
                instance_index,
            });
        }

        let instance = Self::create_instance(&self.device, desc, frame_stamp)?;
        bucket.push(instance);
        self.instance_count += 1;

        let instance_index = bucket.len() - 1;
        tracing::debug!(
            hash = format_args!("{descriptor_hash:016x}"),
            instance_index,
            width = desc.width,
            height = desc.height,
            format = ?desc.format,
            "created transient resource"
        );
        Ok(ResourceHandle {
            descriptor_hash,
            frame_stamp,
            instance_index,
        })
    }

    fn create_instance(
        device: &D,
        desc: &TransientDesc,
        frame_stamp: u64,
    ) -> Result<CachedResource<D::Resource>, TransientError> {
        let layout = desc.layout();
        let address = device.reserve_virtual_range(layout.size_bytes)?;
        let resource =
            match device.create_placed_resource(address, desc, &layout, desc.resting_state()) {
                Ok(resource) => resource,
                Err(err) => {
                    device.release_virtual_range(address, layout.size_bytes);
                    return Err(err);
                }
            };

        let views = match Self::create_views(device, &resource, desc) {
            Ok(views) => views,
            Err(err) => {
                device.destroy_resource(resource);
                device.release_virtual_range(address, layout.size_bytes);
                return Err(err);
            }
        };

        Ok(CachedResource {
            desc: *desc,
            layout,
            address,
            resource,
            views,
            frame_stamp,
            pages: Vec::new(),
            acquired: false,
        })
    }

    fn create_views(
        device: &D,
        resource: &D::Resource,
        desc: &TransientDesc,
    ) -> Result<ResourceViews, TransientError> {
        let view = |flag: BindFlags, kind: ViewKind| -> Result<_, TransientError> {
            if desc.usage.contains(flag) {
                device.create_view(resource, desc, kind).map(Some)
            } else {
                Ok(None)
            }
        };

        Ok(ResourceViews {
            render_target: view(BindFlags::RENDER_TARGET, ViewKind::RenderTarget)?,
            depth_stencil: view(BindFlags::DEPTH_STENCIL, ViewKind::DepthStencil)?,
            shader_read: view(BindFlags::SHADER_READ, ViewKind::ShaderRead)?,
            unordered_access: view(BindFlags::UNORDERED_ACCESS, ViewKind::UnorderedAccess)?,
        })
    }

    /// Resolve a handle claimed in the current frame. Handles from earlier
    /// frames never resolve, even if their instance was not claimed again.
    pub fn get(&self, handle: ResourceHandle) -> Option<&CachedResource<D::Resource>> {
        if handle.frame_stamp != self.frame_stamp {
            return None;
        }
        self.buckets
            .get(&handle.descriptor_hash)?
            .get(handle.instance_index)
            .filter(|instance| instance.frame_stamp == handle.frame_stamp)
    }

    pub fn get_mut(&mut self, handle: ResourceHandle) -> Option<&mut CachedResource<D::Resource>> {
        if handle.frame_stamp != self.frame_stamp {
            return None;
        }
        self.buckets
            .get_mut(&handle.descriptor_hash)?
            .get_mut(handle.instance_index)
            .filter(|instance| instance.frame_stamp == handle.frame_stamp)
    }

    /// Like `get`, for handles the caller knows are live.
    ///
    /// # Panics
    /// If the handle is invalid or was claimed in an earlier frame.
    pub fn get_checked(&self, handle: ResourceHandle) -> &CachedResource<D::Resource> {
        match self.get(handle) {
            Some(instance) => instance,
            None => panic!("transient resource handle {handle} is invalid or stale"),
        }
    }

    /// # Panics
    /// If the handle is invalid or was claimed in an earlier frame.
    pub fn get_checked_mut(&mut self, handle: ResourceHandle) -> &mut CachedResource<D::Resource> {
        match self.get_mut(handle) {
            Some(instance) => instance,
            None => panic!("transient resource handle {handle} is invalid or stale"),
        }
    }

    pub(crate) fn instances_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut CachedResource<D::Resource>> + '_ {
        self.buckets.values_mut().flat_map(|bucket| bucket.iter_mut())
    }

    /// Make every instance claimable again.
    pub fn next_frame(&mut self) {
        self.frame_stamp += 1;
    }

    /// Destroy every cached resource and its address reservation.
    pub fn uninitialize(&mut self) {
        if self.instance_count == 0 {
            return;
        }
        for (_, bucket) in self.buckets.drain() {
            for instance in bucket {
                self.device.destroy_resource(instance.resource);
                self.device
                    .release_virtual_range(instance.address, instance.layout.size_bytes);
            }
        }
        tracing::info!(instances = self.instance_count, "transient cache released");
        self.instance_count = 0;
    }
}

impl<D: TransientDevice> Drop for TransientCache<D> {
    fn drop(&mut self) {
        self.uninitialize();
    }
}
