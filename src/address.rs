//! Physical flash addresses.
//!
//! An [`Address`] names a position in the (channel, die, plane, block, page)
//! hierarchy. Its `valid` level says how many of the leading fields are
//! meaningful, so the same type describes "any die on channel 1" as well as a
//! single page. Blocks and pages are also addressed by flat linear indices,
//! which are what the free pool, candidate sets and GC records key on.

use std::fmt;

use num_integer::Integer;

use crate::config::{BlockId, Config, PageId};

/// How deep into the hierarchy an address is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressValid {
    None,
    Channel,
    Die,
    Plane,
    Block,
    Page,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub channel: usize,
    pub die: usize,
    pub plane: usize,
    pub block: usize,
    pub page: usize,
    pub valid: AddressValid,
}

impl Address {
    pub const NONE: Address = Address {
        channel: 0,
        die: 0,
        plane: 0,
        block: 0,
        page: 0,
        valid: AddressValid::None,
    };

    pub fn new(channel: usize, die: usize, plane: usize, block: usize, page: usize, valid: AddressValid) -> Self {
        Address {
            channel,
            die,
            plane,
            block,
            page,
            valid,
        }
    }

    pub fn page(channel: usize, die: usize, plane: usize, block: usize, page: usize) -> Self {
        Address::new(channel, die, plane, block, page, AddressValid::Page)
    }

    pub fn lun(channel: usize, die: usize) -> Self {
        Address::new(channel, die, 0, 0, 0, AddressValid::Die)
    }

    pub fn is_none(&self) -> bool {
        self.valid == AddressValid::None
    }

    /// Decodes a linear page index.
    pub fn from_linear(linear: PageId, config: &Config) -> Self {
        let (rest, page) = linear.div_rem(&config.pages_per_block);
        let mut address = Address::from_block_index(rest, config);
        address.page = page;
        address.valid = AddressValid::Page;
        address
    }

    /// Decodes a linear block index into a block-level address.
    pub fn from_block_index(index: BlockId, config: &Config) -> Self {
        let (rest, block) = index.div_rem(&config.blocks_per_plane);
        let (rest, plane) = rest.div_rem(&config.planes_per_die);
        let (channel, die) = rest.div_rem(&config.dies_per_channel);
        Address::new(channel, die, plane, block, 0, AddressValid::Block)
    }

    pub fn to_linear(&self, config: &Config) -> PageId {
        self.block_index(config) * config.pages_per_block + self.page
    }

    pub fn block_index(&self, config: &Config) -> BlockId {
        (self.lun_index(config) * config.planes_per_die + self.plane) * config.blocks_per_plane + self.block
    }

    pub fn lun_index(&self, config: &Config) -> usize {
        self.channel * config.dies_per_channel + self.die
    }

    /// The deepest level at which `self` and `other` agree, limited by the
    /// validity of both.
    pub fn compare(&self, other: &Address) -> AddressValid {
        let limit = self.valid.min(other.valid);
        let levels = [
            (AddressValid::Channel, self.channel == other.channel),
            (AddressValid::Die, self.die == other.die),
            (AddressValid::Plane, self.plane == other.plane),
            (AddressValid::Block, self.block == other.block),
            (AddressValid::Page, self.page == other.page),
        ];
        let mut matched = AddressValid::None;
        for (level, equal) in levels {
            if level > limit || !equal {
                break;
            }
            matched = level;
        }
        matched
    }

    pub fn same_block(&self, other: &Address) -> bool {
        self.compare(other) >= AddressValid::Block
    }

    pub fn same_lun(&self, other: &Address) -> bool {
        self.compare(other) >= AddressValid::Die
    }

    pub fn in_range(&self, config: &Config) -> bool {
        self.channel < config.channels
            && self.die < config.dies_per_channel
            && self.plane < config.planes_per_die
            && self.block < config.blocks_per_plane
            && self.page < config.pages_per_block
    }

    /// Same address one level up, e.g. a page address truncated to its block.
    pub fn truncated(&self, valid: AddressValid) -> Address {
        let mut address = *self;
        address.valid = self.valid.min(valid);
        address
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "<none>");
        }
        write!(f, "{}", self.channel)?;
        let rest = [
            (AddressValid::Die, self.die),
            (AddressValid::Plane, self.plane),
            (AddressValid::Block, self.block),
            (AddressValid::Page, self.page),
        ];
        for (level, value) in rest {
            if level > self.valid {
                break;
            }
            write!(f, ":{}", value)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}, {:?})", self, self.valid)
    }
}
