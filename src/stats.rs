//! Diagnostic counters. None of these feed back into GC decisions.

use std::fmt;

use crate::gc::CancelReason;
use crate::ops::{GcKind, MigrationMode};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub app_reads: u64,
    pub app_writes: u64,
    pub trims: u64,

    pub gc_started: u64,
    pub wear_leveling_started: u64,
    pub gc_pages_migrated: u64,
    pub wear_leveling_pages_migrated: u64,
    pub read_write_migrations: u64,
    pub copy_backs: u64,
    /// Migrations whose source was overwritten or trimmed while in flight.
    pub stale_migrations: u64,

    pub gc_erases: u64,
    pub implicit_erases: u64,
    pub retired_blocks: u64,

    pub cancelled_no_candidate: u64,
    pub cancelled_no_space: u64,
    pub cancelled_already_happening: u64,
    pub cancelled_vetoed: u64,
    pub deferred: u64,
    pub emergency_triggers: u64,
}

impl Stats {
    pub fn record_cancel(&mut self, reason: CancelReason) {
        match reason {
            CancelReason::NoCandidate => self.cancelled_no_candidate += 1,
            CancelReason::NotEnoughFreeSpace => self.cancelled_no_space += 1,
            CancelReason::AlreadyHappening => self.cancelled_already_happening += 1,
            CancelReason::Vetoed => self.cancelled_vetoed += 1,
        }
    }

    pub fn record_migration(&mut self, kind: GcKind, mode: MigrationMode) {
        match kind {
            GcKind::Reclaim => self.gc_pages_migrated += 1,
            GcKind::WearLeveling => self.wear_leveling_pages_migrated += 1,
        }
        match mode {
            MigrationMode::ReadWrite => self.read_write_migrations += 1,
            MigrationMode::CopyBack => self.copy_backs += 1,
        }
    }

    pub fn valid_pages_migrated(&self) -> u64 {
        self.gc_pages_migrated + self.wear_leveling_pages_migrated
    }

    pub fn erases(&self) -> u64 {
        self.gc_erases + self.implicit_erases
    }

    pub fn write_amplification(&self) -> f64 {
        if self.app_writes == 0 {
            return 0.0;
        }
        (self.app_writes + self.valid_pages_migrated()) as f64 / self.app_writes as f64
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "reads {} writes {} trims {}", self.app_reads, self.app_writes, self.trims)?;
        writeln!(
            f,
            "gc {} (wear leveling {}), pages migrated {} ({} copy-back, {} stale)",
            self.gc_started,
            self.wear_leveling_started,
            self.valid_pages_migrated(),
            self.copy_backs,
            self.stale_migrations
        )?;
        writeln!(
            f,
            "erases {} (implicit {}), retired blocks {}",
            self.erases(),
            self.implicit_erases,
            self.retired_blocks
        )?;
        writeln!(
            f,
            "cancelled: no candidate {}, no space {}, already happening {}, vetoed {}; deferred {}; emergency {}",
            self.cancelled_no_candidate,
            self.cancelled_no_space,
            self.cancelled_already_happening,
            self.cancelled_vetoed,
            self.deferred,
            self.emergency_triggers
        )?;
        write!(f, "write amplification {:.4}", self.write_amplification())
    }
}
