//! Software device for running the allocator without a GPU.
//!
//! Nothing is rendered; the device only keeps the bookkeeping a driver
//! would (reservations, pools, committed pages, live resources) so tests
//! and tools can inspect what the allocator asked for.

use crate::{
    DeviceCapabilities, FlushFlags, PageMappingCommand, PageRangeEntry, RecordingContext,
    ResourceLayout, SubmissionContext, TransientDesc, TransientDevice, TransientError, UsageState,
    ViewHandle, ViewKind,
};
use latch_paging::{
    div_round_up, PagePoolDevice, PagingError, PhysicalPage, PoolHandle, VirtualAddress,
    PAGE_SIZE_BYTES,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// First address handed out by `reserve_virtual_range`.
const VIRTUAL_BASE: u64 = 0x1_0000_0000;

/// Resource created by `HeadlessDevice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessResource {
    pub id: u64,
    pub address: VirtualAddress,
    pub size_bytes: u64,
}

/// Clonable handle to shared in-memory device state.
#[derive(Clone)]
pub struct HeadlessDevice {
    fast_tier_bytes: u64,
    state: Rc<RefCell<State>>,
}

#[derive(Default)]
struct State {
    next_address: u64,
    reserved: HashMap<u64, u64>,
    next_pool: u64,
    pools: HashMap<u64, (VirtualAddress, u32)>,
    next_page: u64,
    physical: HashSet<u64>,
    fast_mapped: u32,
    next_resource: u64,
    resources: HashMap<u64, String>,
    next_view: u64,
    fail_physical: bool,
}

impl HeadlessDevice {
    /// Device exposing `fast_tier_bytes` of fast memory.
    pub fn new(fast_tier_bytes: u64) -> Self {
        Self {
            fast_tier_bytes,
            state: Rc::new(RefCell::new(State {
                next_address: VIRTUAL_BASE,
                ..State::default()
            })),
        }
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            fast_tier_bytes: self.fast_tier_bytes,
            supports_page_mapping: true,
        }
    }

    /// Make every following physical page commit fail.
    pub fn fail_physical_allocations(&self, fail: bool) {
        self.state.borrow_mut().fail_physical = fail;
    }

    pub fn live_resources(&self) -> usize {
        self.state.borrow().resources.len()
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.state.borrow().reserved.values().sum()
    }

    pub fn registered_pools(&self) -> usize {
        self.state.borrow().pools.len()
    }

    pub fn physical_pages(&self) -> usize {
        self.state.borrow().physical.len()
    }

    pub fn fast_pages_mapped(&self) -> u32 {
        self.state.borrow().fast_mapped
    }

    pub fn debug_name(&self, resource: &HeadlessResource) -> Option<String> {
        self.state.borrow().resources.get(&resource.id).cloned()
    }
}

impl PagePoolDevice for HeadlessDevice {
    fn map_fast_memory(&self, address: VirtualAddress, page_count: u32) -> Result<(), PagingError> {
        let available = (self.fast_tier_bytes / PAGE_SIZE_BYTES) as u32;
        let mut state = self.state.borrow_mut();
        if state.fast_mapped + page_count > available {
            return Err(PagingError::device(
                "map fast memory",
                format!("{page_count} pages at {address} exceed the {available} available"),
            ));
        }
        state.fast_mapped += page_count;
        Ok(())
    }

    fn unmap_fast_memory(&self, _address: VirtualAddress, page_count: u32) -> Result<(), PagingError> {
        let mut state = self.state.borrow_mut();
        state.fast_mapped = state.fast_mapped.saturating_sub(page_count);
        Ok(())
    }

    fn allocate_physical_pages(&self, page_count: u32) -> Result<Vec<PhysicalPage>, PagingError> {
        let mut state = self.state.borrow_mut();
        if state.fail_physical {
            return Err(PagingError::device(
                "allocate physical pages",
                "out of video memory",
            ));
        }
        let start = state.next_page;
        state.next_page += page_count as u64;
        let pages: Vec<PhysicalPage> = (start..state.next_page).map(PhysicalPage).collect();
        state.physical.extend(pages.iter().map(|page| page.0));
        Ok(pages)
    }

    fn map_physical_pages(
        &self,
        address: VirtualAddress,
        pages: &[PhysicalPage],
    ) -> Result<(), PagingError> {
        let state = self.state.borrow();
        match pages.iter().find(|page| !state.physical.contains(&page.0)) {
            Some(page) => Err(PagingError::device(
                "map physical pages",
                format!("page {} mapped at {address} was never committed", page.0),
            )),
            None => Ok(()),
        }
    }

    fn decommit(&self, _address: VirtualAddress, _size_bytes: u64) {}

    fn free_physical_pages(&self, pages: Vec<PhysicalPage>) {
        let mut state = self.state.borrow_mut();
        for page in pages {
            state.physical.remove(&page.0);
        }
    }

    fn register_page_pool(
        &self,
        address: VirtualAddress,
        page_count: u32,
    ) -> Result<PoolHandle, PagingError> {
        let mut state = self.state.borrow_mut();
        let handle = state.next_pool;
        state.next_pool += 1;
        state.pools.insert(handle, (address, page_count));
        Ok(PoolHandle(handle))
    }

    fn unregister_page_pool(&self, pool: PoolHandle) {
        self.state.borrow_mut().pools.remove(&pool.0);
    }
}

impl TransientDevice for HeadlessDevice {
    type Resource = HeadlessResource;

    fn reserve_virtual_range(&self, size_bytes: u64) -> Result<VirtualAddress, TransientError> {
        let size_bytes = div_round_up(size_bytes.max(1), PAGE_SIZE_BYTES) * PAGE_SIZE_BYTES;
        let mut state = self.state.borrow_mut();
        let address = state.next_address;
        state.next_address += size_bytes;
        state.reserved.insert(address, size_bytes);
        Ok(VirtualAddress(address))
    }

    fn release_virtual_range(&self, address: VirtualAddress, _size_bytes: u64) {
        self.state.borrow_mut().reserved.remove(&address.0);
    }

    fn create_placed_resource(
        &self,
        address: VirtualAddress,
        _desc: &TransientDesc,
        layout: &ResourceLayout,
        _initial_state: UsageState,
    ) -> Result<HeadlessResource, TransientError> {
        let mut state = self.state.borrow_mut();
        let reserved = state.reserved.get(&address.0).copied().unwrap_or(0);
        if reserved < layout.size_bytes {
            return Err(TransientError::device(
                "create placed resource",
                format!(
                    "{} bytes do not fit the {reserved} reserved at {address}",
                    layout.size_bytes
                ),
            ));
        }
        let id = state.next_resource;
        state.next_resource += 1;
        state.resources.insert(id, String::new());
        Ok(HeadlessResource {
            id,
            address,
            size_bytes: layout.size_bytes,
        })
    }

    fn create_view(
        &self,
        _resource: &HeadlessResource,
        _desc: &TransientDesc,
        _kind: ViewKind,
    ) -> Result<ViewHandle, TransientError> {
        let mut state = self.state.borrow_mut();
        state.next_view += 1;
        Ok(ViewHandle(state.next_view))
    }

    fn destroy_resource(&self, resource: HeadlessResource) {
        self.state.borrow_mut().resources.remove(&resource.id);
    }

    fn set_debug_name(&self, resource: &HeadlessResource, name: &str) {
        if let Some(slot) = self.state.borrow_mut().resources.get_mut(&resource.id) {
            *slot = name.to_owned();
        }
    }
}

/// Command recorded by `CommandLog`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    Flush(FlushFlags),
    Transition {
        resource: u64,
        before: UsageState,
        after: UsageState,
    },
    /// Marker for work recorded by the caller, such as a draw.
    Work(&'static str),
}

/// Recording context that keeps every command in order.
#[derive(Debug, Default)]
pub struct CommandLog {
    pub commands: Vec<RecordedCommand>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn work(&mut self, label: &'static str) {
        self.commands.push(RecordedCommand::Work(label));
    }

    pub fn flushes(&self) -> Vec<FlushFlags> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::Flush(flags) => Some(*flags),
                _ => None,
            })
            .collect()
    }

    pub fn transitions(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, RecordedCommand::Transition { .. }))
            .count()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

impl RecordingContext<HeadlessResource> for CommandLog {
    fn flush_pipeline(&mut self, flags: FlushFlags) {
        self.commands.push(RecordedCommand::Flush(flags));
    }

    fn transition(&mut self, resource: &HeadlessResource, before: UsageState, after: UsageState) {
        self.commands.push(RecordedCommand::Transition {
            resource: resource.id,
            before,
            after,
        });
    }
}

/// One submitted pool mapping, copied out of the staging arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedMapping {
    pub pool_address: VirtualAddress,
    pub pool_page_count: u32,
    pub batches: Vec<(VirtualAddress, Vec<PageRangeEntry>)>,
}

/// Submission queue that applies page mappings to a software page table.
#[derive(Debug, Default)]
pub struct SubmissionLog {
    pub submitted: Vec<SubmittedMapping>,
    /// Destination page address to (pool address, page index in pool).
    page_table: HashMap<u64, (VirtualAddress, u32)>,
}

impl SubmissionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool page currently backing the page containing `address`.
    pub fn backing_of(&self, address: VirtualAddress) -> Option<(VirtualAddress, u32)> {
        let page = address.0 - address.0 % PAGE_SIZE_BYTES;
        self.page_table.get(&page).copied()
    }

    /// Pool pages backing `page_count` pages from `address`, in order.
    pub fn backing_range(&self, address: VirtualAddress, page_count: u32) -> Vec<Option<(VirtualAddress, u32)>> {
        (0..page_count as u64)
            .map(|page| self.backing_of(address.offset(page * PAGE_SIZE_BYTES)))
            .collect()
    }

    pub fn mapped_pages(&self) -> usize {
        self.page_table.len()
    }
}

impl SubmissionContext for SubmissionLog {
    fn copy_page_mappings(&mut self, command: &PageMappingCommand<'_>) -> Result<(), TransientError> {
        for batch in &command.batches {
            let mut destination = batch.destination;
            for range in batch.ranges {
                if range.start_index_in_pool + range.page_count > command.pool_page_count {
                    return Err(TransientError::device(
                        "copy page mappings",
                        format!(
                            "range {}+{} is outside the {}-page pool at {}",
                            range.start_index_in_pool,
                            range.page_count,
                            command.pool_page_count,
                            command.pool_address
                        ),
                    ));
                }
                for page in 0..range.page_count {
                    self.page_table.insert(
                        destination.0,
                        (command.pool_address, range.start_index_in_pool + page),
                    );
                    destination = destination.offset(PAGE_SIZE_BYTES);
                }
            }
        }

        self.submitted.push(SubmittedMapping {
            pool_address: command.pool_address,
            pool_page_count: command.pool_page_count,
            batches: command
                .batches
                .iter()
                .map(|batch| (batch.destination, batch.ranges.to_vec()))
                .collect(),
        });
        Ok(())
    }
}
