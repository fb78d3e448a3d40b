use std::collections::HashMap;

use byte_unit::Byte;
use log::trace;

use crate::address::Address;
use crate::config::*;

/// Logical-to-physical translation as the GC core sees it.
pub trait AddressTranslator {
    fn lookup(&self, lpn: Lpn) -> Option<Address>;

    /// Reverse lookup for a physical page.
    fn resolve_logical_address(&self, address: &Address) -> Option<Lpn>;

    /// Points `lpn` at `address` and returns the page it used to live in.
    fn commit_new_mapping(&mut self, lpn: Lpn, address: Address) -> Option<Address>;

    fn unmap(&mut self, lpn: Lpn) -> Option<Address>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)] // for Vec resize
pub enum L2PValue {
    Invalid,
    Valid(PageId),
}

/// Page-level mapping table.
pub struct PageMap {
    config: Config,
    l2p: Vec<L2PValue>,
    p2l: HashMap<PageId, Lpn>,
    logical_size: usize,
}

impl PageMap {
    pub fn new(config: &Config) -> Self {
        let logical_size = config.logical_pages();
        let user = Byte::from_bytes((logical_size * config.page_size) as u128);
        let physical = Byte::from_bytes(config.capacity_bytes() as u128);

        trace!("ALL_PAGES: {}", config.total_pages());
        trace!("op_pages: {}", config.total_pages() - logical_size);
        trace!("Physical Capacity: {}", physical.get_appropriate_unit(true));
        trace!("User Capacity: {}", user.get_appropriate_unit(true));

        PageMap {
            config: config.clone(),
            l2p: vec![L2PValue::Invalid; logical_size],
            p2l: HashMap::new(),
            logical_size,
        }
    }

    pub fn get_max_lba(&self) -> Lpn {
        self.logical_size - 1
    }

    pub fn logical_size(&self) -> usize {
        self.logical_size
    }

    pub fn mapped(&self) -> usize {
        self.p2l.len()
    }

    fn decode(&self, value: L2PValue) -> Option<Address> {
        match value {
            L2PValue::Valid(linear) => Some(Address::from_linear(linear, &self.config)),
            L2PValue::Invalid => None,
        }
    }
}

impl AddressTranslator for PageMap {
    fn lookup(&self, lpn: Lpn) -> Option<Address> {
        self.l2p.get(lpn).and_then(|v| self.decode(*v))
    }

    fn resolve_logical_address(&self, address: &Address) -> Option<Lpn> {
        self.p2l.get(&address.to_linear(&self.config)).copied()
    }

    fn commit_new_mapping(&mut self, lpn: Lpn, address: Address) -> Option<Address> {
        assert!(lpn < self.logical_size, "LBA {} is out of range", lpn);
        let linear = address.to_linear(&self.config);
        let old = std::mem::replace(&mut self.l2p[lpn], L2PValue::Valid(linear));
        if let L2PValue::Valid(previous) = old {
            self.p2l.remove(&previous);
        }
        self.p2l.insert(linear, lpn);
        self.decode(old)
    }

    fn unmap(&mut self, lpn: Lpn) -> Option<Address> {
        let old = std::mem::replace(self.l2p.get_mut(lpn)?, L2PValue::Invalid);
        if let L2PValue::Valid(previous) = old {
            self.p2l.remove(&previous);
        }
        self.decode(old)
    }
}
