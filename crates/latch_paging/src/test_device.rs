use crate::{PagePoolDevice, PagingError, PhysicalPage, PoolHandle, VirtualAddress};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// In-memory device that only keeps counts, for allocator tests.
#[derive(Clone, Default)]
pub(crate) struct TestDevice {
    state: Rc<RefCell<State>>,
}

#[derive(Default)]
struct State {
    next_pool: u64,
    next_page: u64,
    pools: HashSet<u64>,
    physical: HashSet<u64>,
    fast_mapped: u32,
    fail_physical: bool,
    fail_registration: bool,
    fail_unmap: bool,
}

impl TestDevice {
    pub fn registered_pools(&self) -> usize {
        self.state.borrow().pools.len()
    }

    pub fn physical_pages(&self) -> usize {
        self.state.borrow().physical.len()
    }

    pub fn fast_pages_mapped(&self) -> u32 {
        self.state.borrow().fast_mapped
    }

    pub fn fail_physical_allocations(&self, fail: bool) {
        self.state.borrow_mut().fail_physical = fail;
    }

    pub fn fail_pool_registration(&self, fail: bool) {
        self.state.borrow_mut().fail_registration = fail;
    }

    pub fn fail_fast_unmap(&self, fail: bool) {
        self.state.borrow_mut().fail_unmap = fail;
    }
}

impl PagePoolDevice for TestDevice {
    fn map_fast_memory(&self, _address: VirtualAddress, page_count: u32) -> Result<(), PagingError> {
        self.state.borrow_mut().fast_mapped += page_count;
        Ok(())
    }

    fn unmap_fast_memory(&self, _address: VirtualAddress, page_count: u32) -> Result<(), PagingError> {
        let mut state = self.state.borrow_mut();
        if state.fail_unmap {
            return Err(PagingError::device("unmap fast memory", "device lost"));
        }
        state.fast_mapped -= page_count;
        Ok(())
    }

    fn allocate_physical_pages(&self, page_count: u32) -> Result<Vec<PhysicalPage>, PagingError> {
        let mut state = self.state.borrow_mut();
        if state.fail_physical {
            return Err(PagingError::device("allocate physical pages", "out of memory"));
        }
        let start = state.next_page;
        state.next_page += page_count as u64;
        let pages: Vec<PhysicalPage> = (start..state.next_page).map(PhysicalPage).collect();
        state.physical.extend(pages.iter().map(|page| page.0));
        Ok(pages)
    }

    fn map_physical_pages(&self, _address: VirtualAddress, _pages: &[PhysicalPage]) -> Result<(), PagingError> {
        Ok(())
    }

    fn decommit(&self, _address: VirtualAddress, _size_bytes: u64) {}

    fn free_physical_pages(&self, pages: Vec<PhysicalPage>) {
        let mut state = self.state.borrow_mut();
        for page in pages {
            state.physical.remove(&page.0);
        }
    }

    fn register_page_pool(&self, _address: VirtualAddress, _page_count: u32) -> Result<PoolHandle, PagingError> {
        let mut state = self.state.borrow_mut();
        if state.fail_registration {
            return Err(PagingError::device("register page pool", "no pool slots left"));
        }
        state.next_pool += 1;
        let id = state.next_pool;
        state.pools.insert(id);
        Ok(PoolHandle(id))
    }

    fn unregister_page_pool(&self, pool: PoolHandle) {
        self.state.borrow_mut().pools.remove(&pool.0);
    }
}
