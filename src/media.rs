//! Page and block state machines.
//!
//! Pages only ever move `Empty -> Valid -> Invalid`, and only an erase of the
//! owning block brings them back to `Empty`. Any other transition is reported
//! as an [`Error`] and must end the run.

use std::fmt;

use log::trace;

use crate::address::{Address, AddressValid};
use crate::config::{BlockId, Config, Counter, Lpn};
use crate::error::{Error, Result};

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum PageState {
    Empty,
    Valid,
    Invalid,
}

#[derive(Clone, Debug)]
pub struct Page {
    pub state: PageState,
    pub logical: Option<Lpn>,
}

impl Page {
    fn empty() -> Self {
        Page {
            state: PageState::Empty,
            logical: None,
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum BlockState {
    Free,
    PartiallyFree,
    Active,
    Inactive,
}

#[derive(Clone)]
pub struct Block {
    address: Address,
    index: BlockId,
    pages: Vec<Page>,
    valid: Counter,
    invalid: Counter,
    state: BlockState,
    erases_remaining: u32,
    max_erases: u32,
    pub age_class: usize,
}

impl Block {
    pub fn new(address: Address, index: BlockId, pages_per_block: usize, max_erases: u32) -> Self {
        Block {
            address: address.truncated(AddressValid::Block),
            index,
            pages: vec![Page::empty(); pages_per_block],
            valid: 0,
            invalid: 0,
            state: BlockState::Free,
            erases_remaining: max_erases,
            max_erases,
            age_class: 0,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn page_address(&self, page: usize) -> Address {
        let mut address = self.address;
        address.page = page;
        address.valid = AddressValid::Page;
        address
    }

    pub fn index(&self) -> BlockId {
        self.index
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    pub fn valid_count(&self) -> Counter {
        self.valid
    }

    pub fn invalid_count(&self) -> Counter {
        self.invalid
    }

    pub fn empty_count(&self) -> Counter {
        self.capacity() - self.valid - self.invalid
    }

    /// Offset of the next page a sequential writer may program.
    pub fn next_page(&self) -> usize {
        self.valid + self.invalid
    }

    pub fn erases_remaining(&self) -> u32 {
        self.erases_remaining
    }

    /// Erases performed so far.
    pub fn age(&self) -> u32 {
        self.max_erases - self.erases_remaining
    }

    pub fn page(&self, offset: usize) -> &Page {
        &self.pages[offset]
    }

    pub fn pages(&self) -> impl Iterator<Item = (usize, &Page)> {
        self.pages.iter().enumerate()
    }

    pub fn write_page(&mut self, offset: usize, lpn: Lpn) -> Result<BlockState> {
        let address = self.page_address(offset);
        let state = self.pages.get(offset).map(|p| p.state).ok_or(Error::AddressOutOfRange(address))?;
        if state != PageState::Empty {
            return Err(Error::PageNotEmpty { address, state });
        }
        if offset != self.next_page() {
            return Err(Error::WriteOutOfOrder {
                address,
                expected: self.next_page(),
            });
        }

        let page = &mut self.pages[offset];
        page.state = PageState::Valid;
        page.logical = Some(lpn);
        self.valid += 1;
        self.refresh_state();
        trace!("write {} lpn {} -> {:?}", address, lpn, self.state);
        Ok(self.state)
    }

    pub fn invalidate_page(&mut self, offset: usize) -> Result<BlockState> {
        let address = self.page_address(offset);
        let state = self.pages.get(offset).map(|p| p.state).ok_or(Error::AddressOutOfRange(address))?;
        if state != PageState::Valid {
            return Err(Error::PageNotValid { address, state });
        }

        self.pages[offset].state = PageState::Invalid;
        self.valid -= 1;
        self.invalid += 1;
        self.refresh_state();
        trace!("invalidate {} -> {:?}", address, self.state);
        Ok(self.state)
    }

    pub fn erase(&mut self) -> Result<()> {
        if self.erases_remaining == 0 {
            return Err(Error::BlockWornOut { block: self.index });
        }
        for page in self.pages.iter_mut() {
            *page = Page::empty();
        }
        self.valid = 0;
        self.invalid = 0;
        self.state = BlockState::Free;
        self.erases_remaining -= 1;
        trace!("erase block {} ({} erases left)", self.address, self.erases_remaining);
        Ok(())
    }

    fn refresh_state(&mut self) {
        let used = self.valid + self.invalid;
        self.state = if used == 0 {
            BlockState::Free
        } else if used < self.capacity() {
            BlockState::PartiallyFree
        } else if self.valid > 0 {
            BlockState::Active
        } else {
            BlockState::Inactive
        };
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block {} [{:?}, valid {}, invalid {}, erases left {}] ",
            self.address, self.state, self.valid, self.invalid, self.erases_remaining
        )?;
        for page in &self.pages {
            let symbol = match page.state {
                PageState::Valid => "V",
                PageState::Invalid => "I",
                PageState::Empty => ".",
            };
            write!(f, "{}", symbol)?;
        }
        Ok(())
    }
}

/// Every block of the device, flat and indexed by linear block index.
pub struct Flash {
    config: Config,
    blocks: Vec<Block>,
}

impl Flash {
    pub fn new(config: &Config) -> Self {
        let blocks = (0..config.total_blocks())
            .map(|index| {
                Block::new(
                    Address::from_block_index(index, config),
                    index,
                    config.pages_per_block,
                    config.max_erases,
                )
            })
            .collect();
        Flash {
            config: config.clone(),
            blocks,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get(&self, index: BlockId) -> &Block {
        &self.blocks[index]
    }

    pub fn get_mut(&mut self, index: BlockId) -> &mut Block {
        &mut self.blocks[index]
    }

    pub fn index_of(&self, address: &Address) -> Result<BlockId> {
        if address.valid < AddressValid::Block || !address.in_range(&self.config) {
            return Err(Error::AddressOutOfRange(*address));
        }
        Ok(address.block_index(&self.config))
    }

    pub fn block(&self, address: &Address) -> Result<&Block> {
        let index = self.index_of(address)?;
        Ok(&self.blocks[index])
    }

    pub fn page_state(&self, address: &Address) -> Result<PageState> {
        Ok(self.block(address)?.page(address.page).state)
    }

    pub fn free_pages(&self) -> usize {
        self.blocks.iter().map(|b| b.empty_count()).sum()
    }
}
