//! Free-space pool.
//!
//! Each LUN (channel, die) has one free-block pointer: the block currently
//! being filled and the offset of its next writable page. Blocks waiting to
//! become pointers sit on per-LUN stacks, one stack per age class. The pool
//! also owns the global page budget: the number of empty pages not yet
//! promised to an application write or a GC migration.

use log::{trace, warn};

use crate::address::Address;
use crate::config::{BlockId, Config};
use crate::error::{Error, Result};
use crate::media::{BlockState, Flash};

pub struct FreePool {
    config: Config,
    pointers: Vec<Option<Address>>,
    write_pending: Vec<bool>,
    /// `[lun][age_class]` stacks of block indices.
    free_blocks: Vec<Vec<Vec<BlockId>>>,
    retired: Vec<bool>,
    free_pages: usize,
    available_for_new_writes: usize,
    min_age: u32,
    max_age: u32,
}

impl FreePool {
    pub fn new(config: &Config, flash: &Flash) -> Self {
        let luns = config.luns();
        let per_lun = config.blocks_per_lun();
        let mut pointers = vec![None; luns];
        let mut free_blocks = vec![vec![Vec::new(); config.num_age_classes]; luns];

        for lun in 0..luns {
            let first = lun * per_lun;
            pointers[lun] = Some(flash.get(first).page_address(0));
            // reversed so the lowest index is popped first
            free_blocks[lun][0].extend((first + 1..first + per_lun).rev());
        }

        let free_pages = flash.free_pages();
        FreePool {
            config: config.clone(),
            pointers,
            write_pending: vec![false; flash.len()],
            free_blocks,
            retired: vec![false; flash.len()],
            free_pages,
            available_for_new_writes: free_pages,
            min_age: 0,
            max_age: 0,
        }
    }

    pub fn pointer(&self, lun: usize) -> Option<Address> {
        self.pointers[lun]
    }

    /// The pointer of `lun` if it can take a write right now.
    pub fn usable_pointer(&self, lun: usize) -> Option<Address> {
        self.pointers[lun].filter(|p| {
            p.page < self.config.pages_per_block && !self.write_pending[p.block_index(&self.config)]
        })
    }

    /// Returns a pointer with a free page inside the requested scope, or
    /// [`Address::NONE`] when the scope has none. `age_class` restricts the
    /// match to pointers whose block currently sits in that class.
    pub fn allocate(&self, channel: Option<usize>, die: Option<usize>, age_class: Option<usize>, flash: &Flash) -> Address {
        for lun in 0..self.config.luns() {
            let (c, d) = (lun / self.config.dies_per_channel, lun % self.config.dies_per_channel);
            if channel.is_some_and(|ch| ch != c) || die.is_some_and(|dd| dd != d) {
                continue;
            }
            let Some(pointer) = self.usable_pointer(lun) else {
                continue;
            };
            let class = flash.get(pointer.block_index(&self.config)).age_class;
            if age_class.is_some_and(|wanted| wanted != class) {
                continue;
            }
            return pointer;
        }
        Address::NONE
    }

    /// Marks the pointer block behind `address` as having a write in flight.
    /// No other write may target that block until the completion arrives.
    pub fn reserve(&mut self, address: &Address) {
        let block = address.block_index(&self.config);
        debug_assert!(!self.write_pending[block], "block {} already has a write in flight", address);
        self.write_pending[block] = true;
    }

    /// Promises one page to an application write. Fails while the budget is
    /// down to the GC reserve.
    pub fn reserve_app_page(&mut self) -> bool {
        if self.available_for_new_writes <= self.config.gc_reserve_pages() {
            return false;
        }
        self.available_for_new_writes -= 1;
        true
    }

    /// Promises `pages` to GC migrations. Caller checks the budget first.
    pub fn reserve_gc_pages(&mut self, pages: usize) {
        debug_assert!(pages <= self.available_for_new_writes);
        self.available_for_new_writes -= pages;
    }

    /// Returns pages promised to migrations that turned out to be stale.
    pub fn release_gc_pages(&mut self, pages: usize) {
        self.available_for_new_writes += pages;
        debug_assert!(self.available_for_new_writes <= self.free_pages);
    }

    /// Advances the pointer past the page just written and swaps in a new
    /// block when it is exhausted.
    pub fn on_write_completed(&mut self, address: &Address, flash: &Flash) -> Result<()> {
        let lun = address.lun_index(&self.config);
        let block = address.block_index(&self.config);
        let pointer = match self.pointers[lun] {
            Some(p) if p.same_block(address) => p,
            _ => {
                return Err(Error::WriteOutOfOrder {
                    address: *address,
                    expected: flash.get(block).next_page(),
                })
            }
        };
        if pointer.page != address.page {
            return Err(Error::WriteOutOfOrder {
                address: *address,
                expected: pointer.page,
            });
        }

        self.write_pending[block] = false;
        self.free_pages -= 1;

        let mut next = pointer;
        next.page += 1;
        trace!("pointer {} advanced to page {}", lun, next.page);
        if next.page < self.config.pages_per_block {
            self.pointers[lun] = Some(next);
            return Ok(());
        }

        self.pointers[lun] = None;
        self.replace_pointer(lun, flash.get(block).age_class, flash);
        Ok(())
    }

    fn replace_pointer(&mut self, lun: usize, preferred_class: usize, flash: &Flash) -> bool {
        let classes = std::iter::once(preferred_class).chain(0..self.config.num_age_classes);
        for class in classes {
            if let Some(block) = self.free_blocks[lun][class].pop() {
                let b = flash.get(block);
                self.pointers[lun] = Some(b.page_address(b.next_page()));
                trace!("lun {} pointer replaced by block {}", lun, b.address());
                return true;
            }
        }
        warn!("lun {} has no free blocks, pointer unusable until an erase", lun);
        false
    }

    /// Hands a block with free pages back to the pool. The block is
    /// reclassified and becomes the LUN pointer straight away if the LUN has
    /// none.
    pub fn return_unfilled_block(&mut self, block: BlockId, flash: &mut Flash) {
        let class = self.age_class_of(flash.get(block).age());
        let b = flash.get_mut(block);
        debug_assert!(matches!(b.state(), BlockState::Free | BlockState::PartiallyFree));
        b.age_class = class;

        let lun = b.address().lun_index(&self.config);
        if self.pointers[lun].is_none() {
            self.pointers[lun] = Some(b.page_address(b.next_page()));
            trace!("lun {} pointer replenished by block {}", lun, b.address());
        } else {
            self.free_blocks[lun][class].push(block);
        }
    }

    /// Accounts for a completed erase. Worn-out blocks are retired instead of
    /// going back to the pool.
    pub fn on_erase_completed(&mut self, block: BlockId, flash: &mut Flash) {
        if flash.get(block).erases_remaining() == 0 {
            // a retired block's pages can never be written again
            warn!("block {} reached its erase limit and is retired", flash.get(block).address());
            self.retired[block] = true;
            self.refresh_age_bounds(flash);
            return;
        }
        self.free_pages += self.config.pages_per_block;
        self.available_for_new_writes += self.config.pages_per_block;
        self.refresh_age_bounds(flash);
        self.return_unfilled_block(block, flash);
    }

    pub fn is_retired(&self, block: BlockId) -> bool {
        self.retired[block]
    }

    fn refresh_age_bounds(&mut self, flash: &Flash) {
        let mut ages = flash
            .blocks()
            .iter()
            .filter(|b| !self.retired[b.index()])
            .map(|b| b.age());
        if let Some(first) = ages.next() {
            let (min, max) = ages.fold((first, first), |(lo, hi), a| (lo.min(a), hi.max(a)));
            self.min_age = min;
            self.max_age = max;
        }
    }

    pub fn age_class_of(&self, age: u32) -> usize {
        let classes = self.config.num_age_classes as u64;
        if self.max_age <= self.min_age || classes == 1 {
            return 0;
        }
        let span = (self.max_age - self.min_age) as u64 + 1;
        let offset = age.clamp(self.min_age, self.max_age) as u64 - self.min_age as u64;
        ((offset * classes) / span) as usize
    }

    pub fn min_age(&self) -> u32 {
        self.min_age
    }

    pub fn max_age(&self) -> u32 {
        self.max_age
    }

    pub fn free_block_count(&self, lun: usize) -> usize {
        self.free_blocks[lun].iter().map(Vec::len).sum()
    }

    pub fn free_block_counts(&self) -> Vec<usize> {
        (0..self.config.luns()).map(|lun| self.free_block_count(lun)).collect()
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn available_for_new_writes(&self) -> usize {
        self.available_for_new_writes
    }

    /// At most one block's worth of empty pages left on the whole device.
    pub fn is_emergency(&self) -> bool {
        self.free_pages <= self.config.pages_per_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Config, Flash, FreePool) {
        let config = Config {
            channels: 1,
            dies_per_channel: 2,
            planes_per_die: 1,
            blocks_per_plane: 3,
            pages_per_block: 2,
            gc_reserve_blocks: 1,
            ..Config::default()
        };
        let flash = Flash::new(&config);
        let pool = FreePool::new(&config, &flash);
        (config, flash, pool)
    }

    fn write(pool: &mut FreePool, flash: &mut Flash, config: &Config, address: Address, lpn: usize) {
        pool.reserve(&address);
        let index = address.block_index(config);
        flash.get_mut(index).write_page(address.page, lpn).unwrap();
        pool.on_write_completed(&address, flash).unwrap();
    }

    #[test]
    fn starts_with_one_pointer_per_lun() {
        let (_, flash, pool) = setup();
        assert_eq!(pool.pointer(0), Some(Address::page(0, 0, 0, 0, 0)));
        assert_eq!(pool.pointer(1), Some(Address::page(0, 1, 0, 0, 0)));
        assert_eq!(pool.free_block_counts(), vec![2, 2]);
        assert_eq!(pool.free_pages(), flash.free_pages());
        assert_eq!(pool.available_for_new_writes(), 12);
    }

    #[test]
    fn allocate_respects_scope_and_pending_writes() {
        let (_, flash, mut pool) = setup();
        let a = pool.allocate(None, Some(1), None, &flash);
        assert_eq!(a, Address::page(0, 1, 0, 0, 0));
        pool.reserve(&a);
        assert!(pool.allocate(None, Some(1), None, &flash).is_none());
        assert_eq!(pool.allocate(None, None, None, &flash), Address::page(0, 0, 0, 0, 0));
        assert!(pool.allocate(Some(1), None, None, &flash).is_none());
        assert!(pool.allocate(None, None, Some(3), &flash).is_none());
    }

    #[test]
    fn pointer_advances_and_swaps_blocks() {
        let (config, mut flash, mut pool) = setup();
        write(&mut pool, &mut flash, &config, Address::page(0, 0, 0, 0, 0), 1);
        assert_eq!(pool.pointer(0), Some(Address::page(0, 0, 0, 0, 1)));
        write(&mut pool, &mut flash, &config, Address::page(0, 0, 0, 0, 1), 2);
        assert_eq!(pool.pointer(0), Some(Address::page(0, 0, 0, 1, 0)));
        assert_eq!(pool.free_block_count(0), 1);
        assert_eq!(pool.free_pages(), flash.free_pages());
    }

    #[test]
    fn exhausted_lun_is_unusable_until_replenished() {
        let (config, mut flash, mut pool) = setup();
        for block in 0..3 {
            for page in 0..2 {
                write(&mut pool, &mut flash, &config, Address::page(0, 0, 0, block, page), block * 2 + page);
            }
        }
        assert_eq!(pool.pointer(0), None);
        assert!(pool.allocate(None, Some(0), None, &flash).is_none());

        for page in 0..2 {
            flash.get_mut(1).invalidate_page(page).unwrap();
        }
        flash.get_mut(1).erase().unwrap();
        pool.on_erase_completed(1, &mut flash);
        assert_eq!(pool.pointer(0), Some(Address::page(0, 0, 0, 1, 0)));
    }

    #[test]
    fn abandoned_pointer_resumes_where_it_stopped() {
        let (config, mut flash, mut pool) = setup();
        write(&mut pool, &mut flash, &config, Address::page(0, 0, 0, 0, 0), 1);
        assert_eq!(flash.get(0).state(), BlockState::PartiallyFree);

        // lun 0 switches to block 1 and hands block 0 back half written
        pool.pointers[0] = None;
        assert!(pool.replace_pointer(0, 0, &flash));
        assert_eq!(pool.pointer(0), Some(Address::page(0, 0, 0, 1, 0)));
        pool.return_unfilled_block(0, &mut flash);
        assert_eq!(pool.free_block_count(0), 2);

        write(&mut pool, &mut flash, &config, Address::page(0, 0, 0, 1, 0), 2);
        write(&mut pool, &mut flash, &config, Address::page(0, 0, 0, 1, 1), 3);
        assert_eq!(pool.pointer(0), Some(Address::page(0, 0, 0, 0, 1)));
        write(&mut pool, &mut flash, &config, Address::page(0, 0, 0, 0, 1), 4);
        assert_eq!(flash.get(0).state(), BlockState::Active);
        assert_eq!(pool.free_pages(), flash.free_pages());
    }

    #[test]
    fn partially_free_block_becomes_missing_pointer() {
        let (config, mut flash, mut pool) = setup();
        write(&mut pool, &mut flash, &config, Address::page(0, 1, 0, 0, 0), 7);
        pool.pointers[1] = None;
        pool.return_unfilled_block(3, &mut flash);
        assert_eq!(pool.pointer(1), Some(Address::page(0, 1, 0, 0, 1)));
        assert_eq!(pool.free_block_count(1), 2);
    }

    #[test]
    fn worn_out_block_is_retired() {
        let config = Config {
            channels: 1,
            dies_per_channel: 2,
            planes_per_die: 1,
            blocks_per_plane: 3,
            pages_per_block: 2,
            gc_reserve_blocks: 1,
            max_erases: 1,
            ..Config::default()
        };
        let mut flash = Flash::new(&config);
        let mut pool = FreePool::new(&config, &flash);
        for page in 0..2 {
            write(&mut pool, &mut flash, &config, Address::page(0, 0, 0, 0, page), page);
            flash.get_mut(0).invalidate_page(page).unwrap();
        }
        let before = pool.free_pages();
        flash.get_mut(0).erase().unwrap();
        pool.on_erase_completed(0, &mut flash);

        assert!(pool.is_retired(0));
        assert_eq!(pool.free_pages(), before);
        assert_eq!(pool.free_block_count(0), 1);
        assert_ne!(pool.pointer(0).map(|p| p.block), Some(0));
        assert_eq!((pool.min_age(), pool.max_age()), (0, 0));
    }

    #[test]
    fn out_of_order_completion_is_fatal() {
        let (_, flash, mut pool) = setup();
        let err = pool.on_write_completed(&Address::page(0, 0, 0, 0, 1), &flash);
        assert!(matches!(err, Err(Error::WriteOutOfOrder { expected: 0, .. })));
    }

    #[test]
    fn app_budget_stops_at_reserve() {
        let (_, _, mut pool) = setup();
        let mut granted = 0;
        while pool.reserve_app_page() {
            granted += 1;
        }
        assert_eq!(granted, 12 - 2);
        pool.reserve_gc_pages(2);
        assert_eq!(pool.available_for_new_writes(), 0);
    }

    #[test]
    fn age_classes_spread_over_observed_range() {
        let (_, _, mut pool) = setup();
        assert_eq!(pool.age_class_of(7), 0);
        pool.min_age = 0;
        pool.max_age = 7;
        let classes: Vec<_> = (0..8).map(|age| pool.age_class_of(age)).collect();
        assert_eq!(classes, vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }
}
