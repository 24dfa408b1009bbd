use crate::{
    AllocatorConfig, AllocatorMetrics, BindFlags, CachedResource, DeviceCapabilities, FlushFlags,
    MappingStage, RecordingContext, ResourceHandle, SubmissionContext, TierToken, TransientCache,
    TransientDesc, TransientDevice, TransientError, TransientResource, UsageState,
};
use latch_paging::{
    div_round_up, mebibytes, FastTierPolicy, MainTierPolicy, MappingPolicy, PageAllocator,
    PageRef, Range, TierKind, VirtualAddress, FAST_TIER_SIZE_BYTES,
};

/// Smallest main tier budget the allocator accepts.
pub const MIN_BUDGET_BYTES: u64 = mebibytes(8);

const UNTITLED: &str = "Untitled";

/// Where the allocator is in the frame protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameState {
    /// No frame started yet.
    Idle,
    /// Between `next_frame` and `finalize`.
    Recording,
    /// Staged mappings were submitted; acquiring again opens a new segment.
    Finalized,
}

/// Snapshot of tier occupancy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocatorStats {
    pub frame: u64,
    pub state: FrameState,
    pub fast_pages_in_use: u64,
    pub fast_capacity_pages: u64,
    pub main_pages_in_use: u64,
    pub main_capacity_pages: u64,
    pub main_block_count: usize,
    pub main_high_water_mark: usize,
    pub cached_instances: usize,
    pub pending_flush: FlushFlags,
}

/// Frame-scoped allocator for transient GPU resources.
///
/// Resource objects come from a `TransientCache`; their memory is a fresh
/// set of pages every time they are acquired, taken from the fast tier as
/// far as the tier tokens ask and from the main tier otherwise. Both tiers
/// live in one virtual reservation, fast tier first.
pub struct TransientAllocator<D: TransientDevice> {
    device: D,
    reservation: Option<(VirtualAddress, u64)>,
    fast_enabled: bool,
    fast: PageAllocator<FastTierPolicy, D>,
    main: PageAllocator<MainTierPolicy, D>,
    cache: TransientCache<D>,
    stage: MappingStage,
    /// Hazards left by releases, applied by the next acquisition.
    pending_flush: FlushFlags,
    state: FrameState,
    frame: u64,
    metrics: AllocatorMetrics,
}

impl<D: TransientDevice> TransientAllocator<D> {
    pub fn new(
        device: D,
        caps: &DeviceCapabilities,
        config: &AllocatorConfig,
    ) -> Result<Self, TransientError> {
        if !caps.supports_page_mapping {
            return Err(TransientError::device(
                "create transient allocator",
                "device cannot back reserved ranges with remapped pages",
            ));
        }

        let fast_bytes = if config.use_fast_tier && caps.has_fast_tier() {
            FAST_TIER_SIZE_BYTES
        } else {
            0
        };
        let main_bytes = config.max_size_bytes.max(MIN_BUDGET_BYTES);
        let block_bytes = MainTierPolicy::BLOCK_SIZE_BYTES;
        let main_reserved = div_round_up(main_bytes, block_bytes) * block_bytes;
        let reserved = fast_bytes + main_reserved;

        let base = device.reserve_virtual_range(reserved)?;
        let fast = PageAllocator::new(device.clone(), base, fast_bytes);
        let main = PageAllocator::new(device.clone(), base.offset(fast_bytes), main_bytes);

        tracing::info!(
            %base,
            fast_tier = fast_bytes > 0,
            fast_bytes,
            main_bytes,
            "transient allocator created"
        );

        Ok(Self {
            cache: TransientCache::new(device.clone()),
            device,
            reservation: Some((base, reserved)),
            fast_enabled: fast_bytes > 0,
            fast,
            main,
            stage: MappingStage::new(),
            pending_flush: FlushFlags::empty(),
            state: FrameState::Idle,
            frame: 0,
            metrics: AllocatorMetrics::new(config.metrics_window),
        })
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn has_fast_tier(&self) -> bool {
        self.fast_enabled
    }

    #[inline]
    pub fn metrics(&self) -> &AllocatorMetrics {
        &self.metrics
    }

    /// Cached instance behind a handle of the current frame.
    pub fn resource(&self, handle: ResourceHandle) -> Option<&CachedResource<D::Resource>> {
        self.cache.get(handle)
    }

    /// Start a new frame. Every tier is reset and every cached instance
    /// becomes claimable again.
    ///
    /// Fails if mappings staged in the previous frame were never finalized.
    pub fn next_frame(&mut self) -> Result<(), TransientError> {
        if !self.stage.is_empty() {
            return Err(TransientError::UnfinalizedMappings {
                pending_pools: self.stage.pool_count(),
            });
        }

        let mut leaked = 0;
        for instance in self.cache.instances_mut().filter(|instance| instance.acquired) {
            instance.acquired = false;
            leaked += 1;
        }
        if leaked > 0 {
            tracing::warn!(
                frame = self.frame,
                leaked,
                "transient resources were never released; their pages are reclaimed"
            );
        }

        if self.state != FrameState::Idle {
            self.metrics.end_frame();
            latch_metrics::metrics! {
                tracing::trace!(
                    avg_fast_pages = self.metrics.average_fast_pages(),
                    avg_main_pages = self.metrics.average_main_pages(),
                    flushes = self.metrics.count(AllocatorMetrics::FLUSHES),
                    "transient tier usage"
                );
            }
        }

        self.fast.next_frame();
        self.main.next_frame();
        self.cache.next_frame();
        self.pending_flush = FlushFlags::empty();
        self.frame += 1;
        self.state = FrameState::Recording;

        tracing::trace!(frame = self.frame, "transient frame started");
        Ok(())
    }

    fn ensure_recording(&mut self) -> Result<(), TransientError> {
        match self.state {
            FrameState::Idle => Err(TransientError::NotRecording),
            FrameState::Recording => Ok(()),
            FrameState::Finalized => {
                self.state = FrameState::Recording;
                Ok(())
            }
        }
    }

    /// Acquire a resource for `desc`, backed by pages placed per `tokens`.
    ///
    /// Any hazard flush pending from earlier releases is recorded into
    /// `ctx` before the resource is handed out. The resource is transitioned
    /// from its resting state to `initial` if they differ.
    pub fn acquire<C: RecordingContext<D::Resource>>(
        &mut self,
        ctx: &mut C,
        desc: &TransientDesc,
        initial: UsageState,
        tokens: &[TierToken],
        name: Option<&str>,
    ) -> Result<TransientResource<D::Resource>, TransientError> {
        self.ensure_recording()?;

        let handle = self.cache.create(desc)?;
        let (page_count, address) = {
            let instance = self.cache.get_checked(handle);
            (instance.page_count(), instance.address)
        };

        let mut pages = Vec::new();
        self.allocate_pages(page_count, tokens, &mut pages)?;
        self.stage.stage(address, &pages);

        if !self.pending_flush.is_empty() {
            ctx.flush_pipeline(self.pending_flush);
            tracing::trace!(flags = ?self.pending_flush, "flushed released transient memory");
            self.metrics.record(AllocatorMetrics::FLUSHES, 1);
            self.pending_flush = FlushFlags::empty();
        }

        let instance = self.cache.get_checked_mut(handle);
        instance.pages = pages;
        instance.acquired = true;

        let resting = instance.desc.resting_state();
        if initial != resting {
            ctx.transition(&instance.resource, resting, initial);
        }
        self.device
            .set_debug_name(&instance.resource, name.unwrap_or(UNTITLED));

        tracing::trace!(
            %handle,
            name = name.unwrap_or(UNTITLED),
            pages = page_count,
            fast_pages = self.fast.ranges_of(&instance.pages).iter().map(|r| r.count).sum::<u32>(),
            "acquired transient resource"
        );

        let resource = TransientResource {
            handle,
            resource: instance.resource.clone(),
            views: instance.views,
        };

        self.metrics.record(AllocatorMetrics::ACQUIRES, 1);
        self.observe_usage();
        Ok(resource)
    }

    /// Acquire with as many pages as possible in the fast tier.
    pub fn acquire_fast<C: RecordingContext<D::Resource>>(
        &mut self,
        ctx: &mut C,
        desc: &TransientDesc,
        initial: UsageState,
        name: Option<&str>,
    ) -> Result<TransientResource<D::Resource>, TransientError> {
        self.acquire(ctx, desc, initial, &[TierToken::fast_remaining()], name)
    }

    /// Acquire entirely from the main tier.
    pub fn acquire_main<C: RecordingContext<D::Resource>>(
        &mut self,
        ctx: &mut C,
        desc: &TransientDesc,
        initial: UsageState,
        name: Option<&str>,
    ) -> Result<TransientResource<D::Resource>, TransientError> {
        self.acquire(ctx, desc, initial, &[], name)
    }

    /// Place `count` pages per `tokens`, with the rest in the main tier.
    ///
    /// Tokens are walked until one of them cannot be fully satisfied.
    /// Nothing stays allocated if the main tier runs out too.
    fn allocate_pages(
        &mut self,
        count: u32,
        tokens: &[TierToken],
        pages: &mut Vec<PageRef>,
    ) -> Result<(), TransientError> {
        let result = self.place_pages(count, tokens, pages);
        if result.is_err() && !pages.is_empty() {
            self.fast.release(pages)?;
            self.main.release(pages)?;
            pages.clear();
        }
        result
    }

    fn place_pages(
        &mut self,
        count: u32,
        tokens: &[TierToken],
        pages: &mut Vec<PageRef>,
    ) -> Result<(), TransientError> {
        let mut outstanding = count;

        for token in tokens {
            if outstanding == 0 {
                break;
            }
            let wanted = token.pages_of(outstanding);
            let unsatisfied = match token.tier {
                TierKind::Fast => self.fast.allocate(wanted, pages)?,
                TierKind::Main => self.main.allocate(wanted, pages)?,
            };
            outstanding -= wanted - unsatisfied;

            if unsatisfied > 0 {
                if token.tier == TierKind::Fast {
                    tracing::debug!(
                        requested = wanted,
                        spilled = unsatisfied,
                        "fast tier full, spilling to main tier"
                    );
                    self.metrics
                        .record(AllocatorMetrics::SPILLED_PAGES, unsatisfied as u64);
                }
                break;
            }
        }

        if outstanding > 0 {
            let unsatisfied = self.main.allocate(outstanding, pages)?;
            if unsatisfied > 0 {
                return Err(TransientError::Exhausted {
                    requested: count,
                    unsatisfied,
                });
            }
        }
        Ok(())
    }

    /// Hand a resource back. Its pages are free for the next acquisition,
    /// which will first flush whatever the resource's usage could still
    /// have in flight.
    pub fn release<C: RecordingContext<D::Resource>>(
        &mut self,
        ctx: &mut C,
        resource: impl Into<ResourceHandle>,
        final_state: UsageState,
    ) -> Result<(), TransientError> {
        self.ensure_recording()?;

        let handle = resource.into();
        let instance = match self.cache.get_mut(handle) {
            Some(instance) if instance.acquired => instance,
            _ => return Err(TransientError::NotAcquired { handle }),
        };

        let resting = instance.desc.resting_state();
        if final_state != resting {
            ctx.transition(&instance.resource, final_state, resting);
        }

        self.fast.release(&instance.pages)?;
        self.main.release(&instance.pages)?;
        instance.acquired = false;

        self.pending_flush |= release_hazards(instance.desc.usage, instance.has_metadata());
        tracing::trace!(%handle, pending = ?self.pending_flush, "released transient resource");

        self.metrics.record(AllocatorMetrics::RELEASES, 1);
        Ok(())
    }

    /// Submit every staged page mapping, one command per pool.
    ///
    /// Must run before the work recorded since the last finalize is
    /// submitted to `queue`. If the queue rejects a command, the pools
    /// submitted before it are dropped from the stage and the rest stay
    /// staged for the next call.
    pub fn finalize<Q: SubmissionContext>(&mut self, queue: &mut Q) -> Result<(), TransientError> {
        if self.state == FrameState::Idle {
            return Err(TransientError::NotRecording);
        }

        let mut failure = None;
        let submitted = {
            let commands = self.stage.commands();
            let mut submitted = 0;
            for command in &commands {
                if let Err(err) = queue.copy_page_mappings(command) {
                    failure = Some(err);
                    break;
                }
                submitted += 1;
            }
            submitted
        };

        if let Some(err) = failure {
            // Pools already on the queue must not be submitted again.
            self.stage.discard_pools(submitted);
            tracing::error!(
                submitted,
                pending_pools = self.stage.pool_count(),
                error = %err,
                "failed to submit transient page mappings"
            );
            return Err(err);
        }
        tracing::trace!(pools = submitted, "finalized transient page mappings");

        self.stage.clear();
        self.state = FrameState::Finalized;
        self.metrics.record(AllocatorMetrics::FINALIZES, 1);
        Ok(())
    }

    /// Fast tier ranges backing the resource, empty if it has none.
    pub fn fast_tier_ranges(&self, handle: impl Into<ResourceHandle>) -> Vec<Range> {
        self.cache
            .get(handle.into())
            .map(|instance| self.fast.ranges_of(&instance.pages))
            .unwrap_or_default()
    }

    /// Release main tier blocks that went unused since the previous clean.
    pub fn clean(&mut self) -> Result<usize, TransientError> {
        Ok(self.main.clean()?)
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            frame: self.frame,
            state: self.state,
            fast_pages_in_use: self.fast.capacity_pages() - self.fast.free_page_count(),
            fast_capacity_pages: self.fast.capacity_pages(),
            main_pages_in_use: self.main.capacity_pages() - self.main.free_page_count(),
            main_capacity_pages: self.main.capacity_pages(),
            main_block_count: self.main.block_count(),
            main_high_water_mark: self.main.high_water_mark(),
            cached_instances: self.cache.instance_count(),
            pending_flush: self.pending_flush,
        }
    }

    fn observe_usage(&mut self) {
        let stats = self.stats();
        self.metrics
            .observe_usage(stats.fast_pages_in_use, stats.main_pages_in_use);
    }

    /// Tear down both tiers, the address reservation and the cache, in that
    /// order. Keeps going after a failure and reports the first one.
    pub fn uninitialize(&mut self) -> Result<(), TransientError> {
        let fast = self.fast.uninitialize();
        let main = self.main.uninitialize();
        if let Some((address, size_bytes)) = self.reservation.take() {
            self.device.release_virtual_range(address, size_bytes);
        }
        self.cache.uninitialize();
        self.stage.clear();
        self.state = FrameState::Idle;
        fast.and(main).map_err(TransientError::from)
    }
}

impl<D: TransientDevice> Drop for TransientAllocator<D> {
    fn drop(&mut self) {
        if let Err(err) = self.uninitialize() {
            tracing::error!(error = %err, "failed to tear down transient allocator");
        }
    }
}

/// Flushes needed before memory last used with `usage` can be rewritten.
pub(crate) fn release_hazards(usage: BindFlags, has_metadata: bool) -> FlushFlags {
    let mut flags = FlushFlags::empty();
    if usage.contains(BindFlags::RENDER_TARGET) {
        flags |= FlushFlags::PIXEL_SHADER | FlushFlags::COLOR_DATA;
        if has_metadata {
            flags |= FlushFlags::COLOR_METADATA;
        }
    }
    if usage.contains(BindFlags::DEPTH_STENCIL) {
        flags |= FlushFlags::PIXEL_SHADER | FlushFlags::DEPTH_DATA;
        if has_metadata {
            flags |= FlushFlags::DEPTH_METADATA;
        }
    }
    if usage.contains(BindFlags::UNORDERED_ACCESS) {
        flags |= FlushFlags::PIXEL_SHADER
            | FlushFlags::COMPUTE_SHADER
            | FlushFlags::TEXTURE_CACHE_INVALIDATE;
    }
    if usage.contains(BindFlags::SHADER_READ) {
        flags |= FlushFlags::PIXEL_SHADER | FlushFlags::COMPUTE_SHADER;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{CommandLog, HeadlessDevice, SubmissionLog};
    use crate::{PageMappingCommand, TextureFormat};
    use latch_paging::{FAST_TIER_PAGE_COUNT, MAIN_BLOCK_PAGE_COUNT};

    fn setup(fast: bool) -> (HeadlessDevice, TransientAllocator<HeadlessDevice>) {
        let device = HeadlessDevice::new(if fast { FAST_TIER_SIZE_BYTES } else { 0 });
        let config = AllocatorConfig {
            max_size_bytes: mebibytes(64),
            ..AllocatorConfig::default()
        };
        let allocator =
            TransientAllocator::new(device.clone(), &device.capabilities(), &config).unwrap();
        (device, allocator)
    }

    /// 16 pages with no metadata plane.
    fn scratch() -> TransientDesc {
        TransientDesc::new(
            512,
            512,
            TextureFormat::R32Float,
            BindFlags::UNORDERED_ACCESS | BindFlags::SHADER_READ,
        )
    }

    #[test]
    fn hazards_per_usage() {
        assert_eq!(
            release_hazards(BindFlags::RENDER_TARGET, true),
            FlushFlags::PIXEL_SHADER | FlushFlags::COLOR_DATA | FlushFlags::COLOR_METADATA
        );
        assert_eq!(
            release_hazards(BindFlags::DEPTH_STENCIL, false),
            FlushFlags::PIXEL_SHADER | FlushFlags::DEPTH_DATA
        );
        assert_eq!(
            release_hazards(BindFlags::UNORDERED_ACCESS, false),
            FlushFlags::PIXEL_SHADER
                | FlushFlags::COMPUTE_SHADER
                | FlushFlags::TEXTURE_CACHE_INVALIDATE
        );
        assert_eq!(
            release_hazards(BindFlags::SHADER_READ, false),
            FlushFlags::PIXEL_SHADER | FlushFlags::COMPUTE_SHADER
        );
    }

    #[test]
    fn acquire_requires_a_frame() {
        let (_device, mut allocator) = setup(false);
        let mut cmds = CommandLog::new();
        let result = allocator.acquire_main(&mut cmds, &scratch(), UsageState::UnorderedAccess, None);
        assert!(matches!(result, Err(TransientError::NotRecording)));
    }

    #[test]
    fn budget_is_clamped_to_minimum() {
        let device = HeadlessDevice::new(0);
        let config = AllocatorConfig {
            max_size_bytes: 1,
            ..AllocatorConfig::default()
        };
        let mut allocator =
            TransientAllocator::new(device.clone(), &device.capabilities(), &config).unwrap();
        allocator.next_frame().unwrap();

        // Two full 4 MiB blocks fit in the 8 MiB minimum, a third does not.
        let mut cmds = CommandLog::new();
        let desc = scratch();
        for _ in 0..(2 * MAIN_BLOCK_PAGE_COUNT / desc.page_count()) {
            allocator
                .acquire_main(&mut cmds, &desc, UsageState::UnorderedAccess, None)
                .unwrap();
        }
        let result = allocator.acquire_main(&mut cmds, &desc, UsageState::UnorderedAccess, None);
        assert!(matches!(
            result,
            Err(TransientError::Exhausted { requested: 16, unsatisfied: 16 })
        ));
        assert_eq!(allocator.stats().main_block_count, 2);
    }

    #[test]
    fn fast_tier_requires_capability_and_opt_in() {
        let (_device, allocator) = setup(true);
        assert!(allocator.has_fast_tier());

        let (_device, allocator) = setup(false);
        assert!(!allocator.has_fast_tier());

        let device = HeadlessDevice::new(FAST_TIER_SIZE_BYTES);
        let config = AllocatorConfig {
            use_fast_tier: false,
            ..AllocatorConfig::default()
        };
        let allocator =
            TransientAllocator::new(device.clone(), &device.capabilities(), &config).unwrap();
        assert!(!allocator.has_fast_tier());
    }

    #[test]
    fn fast_tokens_spill_to_main() {
        let (_device, mut allocator) = setup(true);
        allocator.next_frame().unwrap();
        let mut cmds = CommandLog::new();

        let resource = allocator
            .acquire(
                &mut cmds,
                &scratch(),
                UsageState::UnorderedAccess,
                &[TierToken::fast(6)],
                Some("scratch"),
            )
            .unwrap();

        let fast_pages: u32 = allocator
            .fast_tier_ranges(&resource)
            .iter()
            .map(|range| range.count)
            .sum();
        assert_eq!(fast_pages, 6);

        let stats = allocator.stats();
        assert_eq!(stats.fast_pages_in_use, 6);
        assert_eq!(stats.main_pages_in_use, 10);
    }

    #[test]
    fn fast_tier_never_overflows() {
        let (_device, mut allocator) = setup(true);
        allocator.next_frame().unwrap();
        let mut cmds = CommandLog::new();
        let desc = scratch();

        // 33 acquisitions of 16 pages: 32 fit in the fast tier exactly.
        for _ in 0..33 {
            allocator
                .acquire_fast(&mut cmds, &desc, UsageState::UnorderedAccess, None)
                .unwrap();
        }
        let stats = allocator.stats();
        assert_eq!(stats.fast_pages_in_use, FAST_TIER_PAGE_COUNT as u64);
        assert_eq!(stats.main_pages_in_use, 16);
    }

    #[test]
    fn release_of_unacquired_resource_fails() {
        let (_device, mut allocator) = setup(false);
        allocator.next_frame().unwrap();
        let mut cmds = CommandLog::new();
        let resource = allocator
            .acquire_main(&mut cmds, &scratch(), UsageState::UnorderedAccess, None)
            .unwrap();
        allocator
            .release(&mut cmds, &resource, UsageState::UnorderedAccess)
            .unwrap();
        let again = allocator.release(&mut cmds, &resource, UsageState::UnorderedAccess);
        assert!(matches!(again, Err(TransientError::NotAcquired { .. })));
        assert!(matches!(
            allocator.release(&mut cmds, ResourceHandle::INVALID, UsageState::Common),
            Err(TransientError::NotAcquired { .. })
        ));
    }

    #[test]
    fn next_frame_requires_finalize() {
        let (_device, mut allocator) = setup(false);
        allocator.next_frame().unwrap();
        let mut cmds = CommandLog::new();
        let mut queue = SubmissionLog::new();
        let resource = allocator
            .acquire_main(&mut cmds, &scratch(), UsageState::UnorderedAccess, None)
            .unwrap();
        allocator
            .release(&mut cmds, &resource, UsageState::UnorderedAccess)
            .unwrap();

        assert!(matches!(
            allocator.next_frame(),
            Err(TransientError::UnfinalizedMappings { pending_pools: 1 })
        ));
        allocator.finalize(&mut queue).unwrap();
        assert_eq!(allocator.state(), FrameState::Finalized);
        allocator.next_frame().unwrap();
        assert_eq!(allocator.state(), FrameState::Recording);
    }

    #[test]
    fn transitions_only_when_state_differs() {
        let (_device, mut allocator) = setup(false);
        allocator.next_frame().unwrap();
        let mut cmds = CommandLog::new();
        let desc = TransientDesc::color_target(256, 256, TextureFormat::Rgba8Unorm);

        let resource = allocator
            .acquire_main(&mut cmds, &desc, UsageState::RenderTarget, None)
            .unwrap();
        assert_eq!(cmds.transitions(), 0);
        allocator
            .release(&mut cmds, &resource, UsageState::PixelShaderResource)
            .unwrap();
        assert_eq!(cmds.transitions(), 1);

        allocator
            .acquire_main(&mut cmds, &desc, UsageState::UnorderedAccess, None)
            .unwrap();
        assert_eq!(cmds.transitions(), 2);
    }

    #[test]
    fn debug_names_default_to_untitled() {
        let (device, mut allocator) = setup(false);
        allocator.next_frame().unwrap();
        let mut cmds = CommandLog::new();
        let named = allocator
            .acquire_main(&mut cmds, &scratch(), UsageState::UnorderedAccess, Some("ssao"))
            .unwrap();
        let unnamed = allocator
            .acquire_main(&mut cmds, &scratch(), UsageState::UnorderedAccess, None)
            .unwrap();
        assert_eq!(device.debug_name(&named.resource).as_deref(), Some("ssao"));
        assert_eq!(device.debug_name(&unnamed.resource).as_deref(), Some("Untitled"));
    }

    #[test]
    fn failed_growth_leaves_nothing_allocated() {
        let (device, mut allocator) = setup(false);
        allocator.next_frame().unwrap();
        let mut cmds = CommandLog::new();
        allocator
            .acquire_main(&mut cmds, &scratch(), UsageState::UnorderedAccess, None)
            .unwrap();

        // 80 pages: the rest of the first block fills, the second cannot be committed.
        let desc = scratch().with_array_size(5);
        device.fail_physical_allocations(true);
        let result = allocator.acquire_main(&mut cmds, &desc, UsageState::UnorderedAccess, None);
        assert!(matches!(result, Err(TransientError::Paging(_))));
        assert_eq!(allocator.stats().main_pages_in_use, 16);

        device.fail_physical_allocations(false);
        allocator
            .acquire_main(&mut cmds, &desc, UsageState::UnorderedAccess, None)
            .unwrap();
        assert_eq!(allocator.stats().main_pages_in_use, 96);
    }

    /// Queue that rejects one submission, then accepts everything.
    struct FlakyQueue {
        log: SubmissionLog,
        calls: usize,
        fail_on: usize,
    }

    impl SubmissionContext for FlakyQueue {
        fn copy_page_mappings(
            &mut self,
            command: &PageMappingCommand<'_>,
        ) -> Result<(), TransientError> {
            self.calls += 1;
            if self.calls == self.fail_on {
                return Err(TransientError::device("copy page mappings", "queue lost"));
            }
            self.log.copy_page_mappings(command)
        }
    }

    #[test]
    fn failed_finalize_keeps_only_unsubmitted_pools() {
        let (_device, mut allocator) = setup(true);
        allocator.next_frame().unwrap();
        let mut cmds = CommandLog::new();
        let mut queue = FlakyQueue {
            log: SubmissionLog::new(),
            calls: 0,
            fail_on: 2,
        };

        let fast = allocator
            .acquire_fast(&mut cmds, &scratch(), UsageState::UnorderedAccess, None)
            .unwrap();
        let main = allocator
            .acquire_main(&mut cmds, &scratch(), UsageState::UnorderedAccess, None)
            .unwrap();

        assert!(allocator.finalize(&mut queue).is_err());
        assert_eq!(queue.log.submitted.len(), 1);
        assert_eq!(allocator.state(), FrameState::Recording);
        assert!(matches!(
            allocator.next_frame(),
            Err(TransientError::UnfinalizedMappings { pending_pools: 1 })
        ));

        allocator.finalize(&mut queue).unwrap();
        let pools: Vec<_> = queue.log.submitted.iter().map(|s| s.pool_address).collect();
        assert_eq!(pools.len(), 2);
        assert_ne!(pools[0], pools[1]);
        assert_eq!(queue.log.mapped_pages(), 32);
        assert!(queue.log.backing_of(fast.resource.address).is_some());
        assert!(queue.log.backing_of(main.resource.address).is_some());
        allocator.next_frame().unwrap();
    }

    #[test]
    fn handles_from_an_earlier_frame_are_stale() {
        let (_device, mut allocator) = setup(true);
        let mut cmds = CommandLog::new();
        let mut queue = SubmissionLog::new();
        allocator.next_frame().unwrap();
        let resource = allocator
            .acquire_fast(&mut cmds, &scratch(), UsageState::UnorderedAccess, None)
            .unwrap();
        assert!(!allocator.fast_tier_ranges(&resource).is_empty());
        allocator.finalize(&mut queue).unwrap();

        allocator.next_frame().unwrap();
        assert!(allocator.fast_tier_ranges(&resource).is_empty());
        assert!(allocator.resource(resource.handle).is_none());
        assert!(matches!(
            allocator.release(&mut cmds, &resource, UsageState::UnorderedAccess),
            Err(TransientError::NotAcquired { .. })
        ));
    }

    #[test]
    fn clean_releases_idle_main_blocks() {
        let (device, mut allocator) = setup(false);
        let mut cmds = CommandLog::new();
        let mut queue = SubmissionLog::new();
        let desc = scratch().with_array_size(8);

        allocator.next_frame().unwrap();
        let big = allocator
            .acquire_main(&mut cmds, &desc, UsageState::UnorderedAccess, None)
            .unwrap();
        allocator
            .release(&mut cmds, &big, UsageState::UnorderedAccess)
            .unwrap();
        allocator.finalize(&mut queue).unwrap();
        assert_eq!(allocator.stats().main_block_count, 2);
        assert_eq!(allocator.clean().unwrap(), 0);

        allocator.next_frame().unwrap();
        allocator.finalize(&mut queue).unwrap();
        assert_eq!(allocator.clean().unwrap(), 2);
        assert_eq!(allocator.stats().main_block_count, 0);
        assert_eq!(device.physical_pages(), 0);
    }

    #[test]
    fn teardown_returns_everything() {
        let (device, mut allocator) = setup(true);
        allocator.next_frame().unwrap();
        let mut cmds = CommandLog::new();
        allocator
            .acquire_fast(&mut cmds, &scratch(), UsageState::UnorderedAccess, None)
            .unwrap();
        allocator
            .acquire_main(&mut cmds, &scratch(), UsageState::UnorderedAccess, None)
            .unwrap();
        assert!(device.registered_pools() > 0);

        drop(allocator);
        assert_eq!(device.registered_pools(), 0);
        assert_eq!(device.physical_pages(), 0);
        assert_eq!(device.fast_pages_mapped(), 0);
        assert_eq!(device.live_resources(), 0);
        assert_eq!(device.reserved_bytes(), 0);
    }
}
