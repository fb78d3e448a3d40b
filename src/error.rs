//! Crate error type.
//!
//! Every variant except `Config`, `Io`, `Json` and `OutOfSpace` is an internal
//! consistency violation: the block/page invariants no longer hold and the
//! run must stop. Recoverable GC conditions are never reported here, they are
//! [`crate::gc::GcOutcome`] values.

use thiserror::Error;

use crate::address::Address;
use crate::config::{ConfigError, Lpn};
use crate::media::PageState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot write page {address}: page is {state:?}, flash pages are write-once")]
    PageNotEmpty { address: Address, state: PageState },

    #[error("cannot invalidate page {address}: page is {state:?}")]
    PageNotValid { address: Address, state: PageState },

    #[error("write to {address} is out of order, block cursor is at page {expected}")]
    WriteOutOfOrder { address: Address, expected: usize },

    #[error("block {block} has no erases remaining")]
    BlockWornOut { block: usize },

    #[error("block {block} is already being reclaimed")]
    AlreadyReclaiming { block: usize },

    #[error("block {block} has no reclamation or erase in progress")]
    NotReclaiming { block: usize },

    #[error("block {block} has {valid} valid pages left after its last migration")]
    UnfinishedMigration { block: usize, valid: usize },

    #[error("lpn {lpn} moved while its page at {expected} was migrating, mapping was {found:?}")]
    MappingMismatch {
        lpn: Lpn,
        expected: Address,
        found: Option<Address>,
    },

    #[error("address {0} is outside the device geometry")]
    AddressOutOfRange(Address),

    #[error("write to {0} carries no logical page")]
    MissingLpn(Address),

    #[error("device is out of space: {stalled} writes stalled with nothing in flight")]
    OutOfSpace { stalled: usize },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
