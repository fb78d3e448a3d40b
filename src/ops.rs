//! Operations exchanged with the event scheduler.

use crate::address::Address;
use crate::config::{BlockId, Lpn, Time};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Erase,
    /// Read into the die's page register without transferring data off-chip.
    CopyBackRead,
    CopyBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    ReadWrite,
    CopyBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Reclaim,
    WearLeveling,
}

/// One valid page moving out of a block under reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub victim: BlockId,
    pub source: Address,
    pub lpn: Lpn,
    pub dest: Address,
    pub mode: MigrationMode,
    pub kind: GcKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub address: Address,
    pub lpn: Option<Lpn>,
    pub migration: Option<Migration>,
}

impl Operation {
    pub fn read(address: Address, lpn: Lpn) -> Self {
        Operation {
            kind: OpKind::Read,
            address,
            lpn: Some(lpn),
            migration: None,
        }
    }

    pub fn write(address: Address, lpn: Lpn) -> Self {
        Operation {
            kind: OpKind::Write,
            address,
            lpn: Some(lpn),
            migration: None,
        }
    }

    pub fn erase(address: Address) -> Self {
        Operation {
            kind: OpKind::Erase,
            address,
            lpn: None,
            migration: None,
        }
    }

    /// First half of a migration: read the source page.
    pub fn migration_read(m: Migration) -> Self {
        let kind = match m.mode {
            MigrationMode::ReadWrite => OpKind::Read,
            MigrationMode::CopyBack => OpKind::CopyBackRead,
        };
        Operation {
            kind,
            address: m.source,
            lpn: Some(m.lpn),
            migration: Some(m),
        }
    }

    /// Second half of a migration: program the destination page.
    pub fn migration_write(m: Migration) -> Self {
        let kind = match m.mode {
            MigrationMode::ReadWrite => OpKind::Write,
            MigrationMode::CopyBack => OpKind::CopyBack,
        };
        Operation {
            kind,
            address: m.dest,
            lpn: Some(m.lpn),
            migration: Some(m),
        }
    }

    pub fn is_gc(&self) -> bool {
        self.migration.is_some()
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, OpKind::Write | OpKind::CopyBack)
    }
}

/// The event scheduler the controller hands operations to. Completions come
/// back through the controller's `register_*_outcome` methods.
pub trait Scheduler {
    fn schedule(&mut self, op: Operation);

    fn now(&self) -> Time;

    /// Operations queued or running on a LUN.
    fn lun_load(&self, lun: usize) -> usize;
}
