//! Per-frame tier usage, compiled down to no-ops without the `metrics` feature.

use latch_metrics::{Counter, RingBuffer};

/// Rolling view of how the allocator uses its tiers.
#[derive(Debug)]
pub struct AllocatorMetrics {
    events: Counter,
    fast_pages: RingBuffer<u64>,
    main_pages: RingBuffer<u64>,
    frame_fast_peak: u64,
    frame_main_peak: u64,
}

impl AllocatorMetrics {
    pub const ACQUIRES: &'static str = "acquires";
    pub const RELEASES: &'static str = "releases";
    pub const FLUSHES: &'static str = "flushes";
    pub const SPILLED_PAGES: &'static str = "spilled_pages";
    pub const FINALIZES: &'static str = "finalizes";
    pub const FRAMES: &'static str = "frames";

    pub fn new(window: usize) -> Self {
        Self {
            events: Counter::new(),
            fast_pages: RingBuffer::new(window),
            main_pages: RingBuffer::new(window),
            frame_fast_peak: 0,
            frame_main_peak: 0,
        }
    }

    #[inline]
    pub(crate) fn record(&mut self, event: &'static str, value: u64) {
        self.events.increment(event, value);
    }

    /// Track the pages in use right now against this frame's peak.
    pub(crate) fn observe_usage(&mut self, fast_pages: u64, main_pages: u64) {
        self.frame_fast_peak = self.frame_fast_peak.max(fast_pages);
        self.frame_main_peak = self.frame_main_peak.max(main_pages);
    }

    /// Close the current frame's window sample.
    pub(crate) fn end_frame(&mut self) {
        self.fast_pages.push(self.frame_fast_peak);
        self.main_pages.push(self.frame_main_peak);
        self.frame_fast_peak = 0;
        self.frame_main_peak = 0;
        self.events.increment(Self::FRAMES, 1);
    }

    /// Total of a named event since construction.
    pub fn count(&self, event: &str) -> u64 {
        self.events.get(event)
    }

    pub fn average_fast_pages(&self) -> u64 {
        self.fast_pages.average()
    }

    pub fn peak_fast_pages(&self) -> u64 {
        self.fast_pages.max()
    }

    pub fn average_main_pages(&self) -> u64 {
        self.main_pages.average()
    }

    pub fn peak_main_pages(&self) -> u64 {
        self.main_pages.max()
    }

    pub fn frames_sampled(&self) -> usize {
        self.fast_pages.len()
    }
}
