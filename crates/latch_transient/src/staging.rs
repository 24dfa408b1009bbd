//! Page mappings staged during recording and submitted at finalize.
//!
//! Everything lives in flat arenas addressed by index: pools, batches and
//! range entries are appended while resources are acquired, and borrowed
//! views over them are only built once `commands` is called.

use bytemuck::{Pod, Zeroable};
use latch_paging::{PageRef, VirtualAddress};
use std::collections::HashMap;

/// One contiguous run of pages taken from a pool.
///
/// Laid out the way page-mapping entries are handed to a driver.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct PageRangeEntry {
    pub page_count: u32,
    pub start_index_in_pool: u32,
}

#[derive(Debug)]
struct PoolMapping {
    address: VirtualAddress,
    page_count: u32,
}

#[derive(Debug)]
struct Batch {
    pool: usize,
    destination: VirtualAddress,
    ranges: std::ops::Range<usize>,
}

/// Ranges of one pool mapped back to back starting at `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMappingBatch<'a> {
    pub destination: VirtualAddress,
    pub ranges: &'a [PageRangeEntry],
}

impl PageMappingBatch<'_> {
    pub fn page_count(&self) -> u32 {
        self.ranges.iter().map(|range| range.page_count).sum()
    }

    /// Range entries as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.ranges)
    }
}

/// Every mapping into one physical pool staged since the last finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMappingCommand<'a> {
    pub pool_address: VirtualAddress,
    pub pool_page_count: u32,
    pub batches: Vec<PageMappingBatch<'a>>,
}

impl PageMappingCommand<'_> {
    pub fn page_count(&self) -> u32 {
        self.batches.iter().map(PageMappingBatch::page_count).sum()
    }
}

#[derive(Debug, Default)]
pub struct MappingStage {
    pools: Vec<PoolMapping>,
    pool_lookup: HashMap<VirtualAddress, usize>,
    batches: Vec<Batch>,
    ranges: Vec<PageRangeEntry>,
}

impl MappingStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `refs` to back a resource placed at `destination`, in order.
    ///
    /// Consecutive refs into the same pool share a batch; every switch to a
    /// different pool starts a new one at the next destination page.
    pub fn stage(&mut self, destination: VirtualAddress, refs: &[PageRef]) {
        let mut offset = 0u64;
        let mut current: Option<usize> = None;

        for page in refs {
            let pool = self.pool_index(page);
            let batch = match current {
                Some(batch) if self.batches[batch].pool == pool => batch,
                _ => {
                    let start = self.ranges.len();
                    self.batches.push(Batch {
                        pool,
                        destination: destination.offset(offset),
                        ranges: start..start,
                    });
                    self.batches.len() - 1
                }
            };

            self.ranges.push(PageRangeEntry {
                page_count: page.range.count,
                start_index_in_pool: page.range.start,
            });
            self.batches[batch].ranges.end = self.ranges.len();
            current = Some(batch);
            offset += page.size_bytes();
        }
    }

    fn pool_index(&mut self, page: &PageRef) -> usize {
        let pools = &mut self.pools;
        *self
            .pool_lookup
            .entry(page.base_address)
            .or_insert_with(|| {
                pools.push(PoolMapping {
                    address: page.base_address,
                    page_count: page.block_page_count,
                });
                pools.len() - 1
            })
    }

    /// One command per pool, in the order pools were first staged.
    pub fn commands(&self) -> Vec<PageMappingCommand<'_>> {
        let mut commands: Vec<PageMappingCommand<'_>> = self
            .pools
            .iter()
            .map(|pool| PageMappingCommand {
                pool_address: pool.address,
                pool_page_count: pool.page_count,
                batches: Vec::new(),
            })
            .collect();

        for batch in &self.batches {
            commands[batch.pool].batches.push(PageMappingBatch {
                destination: batch.destination,
                ranges: &self.ranges[batch.ranges.clone()],
            });
        }
        commands
    }

    /// Drop the first `count` pools and everything staged into them,
    /// keeping the rest in order.
    pub fn discard_pools(&mut self, count: usize) {
        if count >= self.pools.len() {
            self.clear();
            return;
        }

        let batches = std::mem::take(&mut self.batches);
        let ranges = std::mem::take(&mut self.ranges);
        self.pools.drain(..count);
        self.pool_lookup.clear();
        for (index, pool) in self.pools.iter().enumerate() {
            self.pool_lookup.insert(pool.address, index);
        }

        for batch in batches.into_iter().filter(|batch| batch.pool >= count) {
            let start = self.ranges.len();
            self.ranges.extend_from_slice(&ranges[batch.ranges]);
            self.batches.push(Batch {
                pool: batch.pool - count,
                destination: batch.destination,
                ranges: start..self.ranges.len(),
            });
        }
    }

    pub fn clear(&mut self) {
        self.pools.clear();
        self.pool_lookup.clear();
        self.batches.clear();
        self.ranges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latch_paging::{BlockId, Range, TierKind, PAGE_SIZE_BYTES};

    fn page(tier: TierKind, block: u32, pool: u64, start: u32, count: u32) -> PageRef {
        PageRef {
            base_address: VirtualAddress(pool),
            block_page_count: 64,
            block: BlockId::new(tier, block),
            range: Range::new(start, count),
        }
    }

    #[test]
    fn consecutive_refs_share_a_batch() {
        let mut stage = MappingStage::new();
        let destination = VirtualAddress(0x1000_0000);
        stage.stage(
            destination,
            &[
                page(TierKind::Main, 0, 0x400_0000, 0, 4),
                page(TierKind::Main, 0, 0x400_0000, 10, 2),
            ],
        );

        let commands = stage.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].batches.len(), 1);
        let batch = commands[0].batches[0];
        assert_eq!(batch.destination, destination);
        assert_eq!(
            batch.ranges,
            &[
                PageRangeEntry { page_count: 4, start_index_in_pool: 0 },
                PageRangeEntry { page_count: 2, start_index_in_pool: 10 },
            ]
        );
        assert_eq!(batch.as_bytes().len(), 16);
    }

    #[test]
    fn pool_switch_starts_batch_at_next_page() {
        let mut stage = MappingStage::new();
        let destination = VirtualAddress(0x1000_0000);
        stage.stage(
            destination,
            &[
                page(TierKind::Fast, 0, 0x0, 500, 12),
                page(TierKind::Main, 0, 0x200_0000, 0, 8),
            ],
        );

        let commands = stage.commands();
        assert_eq!(stage.pool_count(), 2);
        assert_eq!(commands[0].pool_address, VirtualAddress(0x0));
        assert_eq!(commands[0].page_count(), 12);
        assert_eq!(commands[1].batches[0].destination, destination.offset(12 * PAGE_SIZE_BYTES));
        assert_eq!(commands[1].page_count(), 8);
    }

    #[test]
    fn resources_in_one_pool_share_a_command() {
        let mut stage = MappingStage::new();
        stage.stage(VirtualAddress(0x1000_0000), &[page(TierKind::Main, 1, 0x600_0000, 0, 3)]);
        stage.stage(VirtualAddress(0x2000_0000), &[page(TierKind::Main, 1, 0x600_0000, 3, 5)]);

        let commands = stage.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].batches.len(), 2);
        assert_eq!(commands[0].batches[1].destination, VirtualAddress(0x2000_0000));

        stage.clear();
        assert!(stage.is_empty());
        assert!(stage.commands().is_empty());
    }

    #[test]
    fn discarded_pools_leave_the_rest_intact() {
        let mut stage = MappingStage::new();
        stage.stage(
            VirtualAddress(0x1000_0000),
            &[
                page(TierKind::Fast, 0, 0x0, 0, 4),
                page(TierKind::Main, 0, 0x200_0000, 0, 2),
            ],
        );
        stage.stage(VirtualAddress(0x2000_0000), &[page(TierKind::Main, 1, 0x600_0000, 7, 3)]);
        stage.stage(VirtualAddress(0x3000_0000), &[page(TierKind::Main, 0, 0x200_0000, 2, 1)]);

        stage.discard_pools(1);
        let commands = stage.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].pool_address, VirtualAddress(0x200_0000));
        assert_eq!(commands[0].batches.len(), 2);
        assert_eq!(
            commands[0].batches[0].destination,
            VirtualAddress(0x1000_0000).offset(4 * PAGE_SIZE_BYTES)
        );
        assert_eq!(
            commands[0].batches[1].ranges,
            &[PageRangeEntry { page_count: 1, start_index_in_pool: 2 }]
        );
        assert_eq!(commands[1].pool_address, VirtualAddress(0x600_0000));
        assert_eq!(commands[1].page_count(), 3);

        // Pools staged afterwards still join their existing command.
        stage.stage(VirtualAddress(0x4000_0000), &[page(TierKind::Main, 1, 0x600_0000, 0, 2)]);
        assert_eq!(stage.pool_count(), 2);
        assert_eq!(stage.commands()[1].batches.len(), 2);

        stage.discard_pools(2);
        assert!(stage.is_empty());
        assert_eq!(stage.pool_count(), 0);
    }
}
