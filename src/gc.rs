//! Reclamation: victim admission, page migration and the final erase.
//!
//! A reclamation moves through
//! `Active (candidate) -> in flight -> migrating -> fully invalid -> erase
//! queued -> erasing -> Free`. Migrations into one destination block are
//! strictly serialized and each channel runs at most one erase at a time.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, trace, warn};

use crate::address::Address;
use crate::candidates::GcScope;
use crate::config::{BlockId, Config, CopyBackConfig, Lpn};
use crate::controller::{Controller, Io};
use crate::error::{Error, Result};
use crate::media::{BlockState, PageState};
use crate::ops::{GcKind, Migration, MigrationMode, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    NoCandidate,
    NotEnoughFreeSpace,
    AlreadyHappening,
    Vetoed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    Started { victim: BlockId },
    Cancelled(CancelReason),
    /// The requested block has nothing to reclaim.
    Skipped,
    /// Too many reclamations already running.
    Deferred,
}

/// Book-keeping for a block under reclamation.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    remaining: usize,
    lun: usize,
}

/// A migration that has not been given a destination yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMigration {
    pub victim: BlockId,
    pub source: Address,
    pub lpn: Lpn,
    pub kind: GcKind,
}

/// Migrations parked behind an in-flight write to their destination block,
/// or with no destination at all until an erase replenishes a pointer.
#[derive(Debug, Default)]
pub struct DependentQueue {
    by_block: HashMap<BlockId, VecDeque<PendingMigration>>,
    unplaced: VecDeque<PendingMigration>,
}

impl DependentQueue {
    pub fn push(&mut self, block: BlockId, m: PendingMigration) {
        self.by_block.entry(block).or_default().push_back(m);
    }

    pub fn push_unplaced(&mut self, m: PendingMigration) {
        self.unplaced.push_back(m);
    }

    pub fn take(&mut self, block: BlockId) -> VecDeque<PendingMigration> {
        self.by_block.remove(&block).unwrap_or_default()
    }

    pub fn take_unplaced(&mut self) -> VecDeque<PendingMigration> {
        std::mem::take(&mut self.unplaced)
    }

    pub fn len(&self) -> usize {
        self.by_block.values().map(VecDeque::len).sum::<usize>() + self.unplaced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consecutive copy-backs per logical page. A read/write relocation passes
/// the data through the controller's ECC and clears the count.
#[derive(Debug)]
pub struct CopyBackCounter {
    counts: HashMap<Lpn, u32>,
    max_repeats: u32,
    max_tracked: usize,
}

impl CopyBackCounter {
    pub fn new(config: &CopyBackConfig) -> Self {
        CopyBackCounter {
            counts: HashMap::new(),
            max_repeats: config.max_repeats,
            max_tracked: config.max_tracked_addresses,
        }
    }

    pub fn allows(&self, lpn: Lpn) -> bool {
        if self.max_repeats == 0 {
            return false;
        }
        match self.counts.get(&lpn) {
            Some(n) => *n < self.max_repeats,
            None => self.counts.len() < self.max_tracked,
        }
    }

    pub fn record(&mut self, lpn: Lpn) {
        *self.counts.entry(lpn).or_insert(0) += 1;
    }

    pub fn reset(&mut self, lpn: Lpn) {
        self.counts.remove(&lpn);
    }

    pub fn count(&self, lpn: Lpn) -> u32 {
        self.counts.get(&lpn).copied().unwrap_or(0)
    }
}

pub struct GcState {
    in_flight: HashMap<BlockId, InFlight>,
    lun_in_progress: Vec<usize>,
    dependents: DependentQueue,
    /// Blocks with an erase queued or running.
    erasing: HashSet<BlockId>,
    erase_running: Vec<Option<BlockId>>,
    erase_queue: Vec<VecDeque<BlockId>>,
    copy_back: CopyBackCounter,
}

impl GcState {
    pub fn new(config: &Config) -> Self {
        GcState {
            in_flight: HashMap::new(),
            lun_in_progress: vec![0; config.luns()],
            dependents: DependentQueue::default(),
            erasing: HashSet::new(),
            erase_running: vec![None; config.channels],
            erase_queue: vec![VecDeque::new(); config.channels],
            copy_back: CopyBackCounter::new(&config.copy_back),
        }
    }

    pub fn in_progress(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_reclaiming(&self, block: BlockId) -> bool {
        self.in_flight.contains_key(&block)
    }

    pub fn is_erasing(&self, block: BlockId) -> bool {
        self.erasing.contains(&block)
    }

    pub fn erase_pending(&self) -> bool {
        !self.erasing.is_empty()
    }

    pub fn lun_busy(&self, lun: usize) -> bool {
        self.lun_in_progress[lun] > 0
    }

    pub fn remaining(&self, block: BlockId) -> Option<usize> {
        self.in_flight.get(&block).map(|r| r.remaining)
    }

    pub fn queued_migrations(&self) -> usize {
        self.dependents.len()
    }

    pub fn running_erase(&self, channel: usize) -> Option<BlockId> {
        self.erase_running[channel]
    }

    pub fn queued_erases(&self, channel: usize) -> usize {
        self.erase_queue[channel].len()
    }

    pub fn copy_backs(&self, lpn: Lpn) -> u32 {
        self.copy_back.count(lpn)
    }
}

impl Controller {
    pub fn gc_state(&self) -> &GcState {
        &self.gc
    }

    fn cancel(&mut self, reason: CancelReason, scope: &GcScope) -> GcOutcome {
        debug!("gc {:?} cancelled: {:?}", scope, reason);
        self.stats.record_cancel(reason);
        GcOutcome::Cancelled(reason)
    }

    /// Block and LUN coordinates of a scope must name real hardware.
    fn check_scope(&self, scope: &GcScope) -> Result<()> {
        if let Some(block) = scope.block {
            if block >= self.flash.len() {
                return Err(Error::AddressOutOfRange(Address::from_block_index(block, &self.config)));
            }
        }
        let channel = scope.channel.unwrap_or(0);
        let die = scope.die.unwrap_or(0);
        if channel >= self.config.channels || die >= self.config.dies_per_channel {
            return Err(Error::AddressOutOfRange(Address::lun(channel, die)));
        }
        Ok(())
    }

    pub(crate) fn try_reclaim(&mut self, scope: GcScope, io: &mut Io<'_>) -> Result<GcOutcome> {
        self.check_scope(&scope)?;
        if let Some(block) = scope.block {
            if matches!(self.flash.get(block).state(), BlockState::Free | BlockState::PartiallyFree) {
                return Ok(GcOutcome::Skipped);
            }
        }
        if let (Some(channel), Some(die)) = (scope.channel, scope.die) {
            if self.gc.lun_busy(channel * self.config.dies_per_channel + die) {
                return Ok(self.cancel(CancelReason::AlreadyHappening, &scope));
            }
        }

        let Some(victim) = self.candidates.select_victim(&scope, &self.flash) else {
            return Ok(self.cancel(CancelReason::NoCandidate, &scope));
        };
        let (valid, lun) = {
            let block = self.flash.get(victim);
            (block.valid_count(), block.address().lun_index(&self.config))
        };
        if self.pool.available_for_new_writes() < valid {
            return Ok(self.cancel(CancelReason::NotEnoughFreeSpace, &scope));
        }
        if self.gc.lun_busy(lun) {
            return Ok(self.cancel(CancelReason::AlreadyHappening, &scope));
        }
        if self.gc.in_progress() >= self.config.max_concurrent_gc {
            debug!("gc {:?} deferred, {} already running", scope, self.gc.in_progress());
            self.stats.deferred += 1;
            return Ok(GcOutcome::Deferred);
        }
        if !self.may_reclaim(victim, io) {
            return Ok(self.cancel(CancelReason::Vetoed, &scope));
        }

        self.start_reclaim(victim, GcKind::Reclaim, io)?;
        Ok(GcOutcome::Started { victim })
    }

    /// Commits to `victim`: takes it out of candidacy, reserves pages for
    /// its valid data and dispatches one migration per valid page.
    pub(crate) fn start_reclaim(&mut self, victim: BlockId, kind: GcKind, io: &mut Io<'_>) -> Result<()> {
        if self.gc.is_reclaiming(victim) || self.gc.is_erasing(victim) {
            return Err(Error::AlreadyReclaiming { block: victim });
        }
        self.candidates.unregister(victim);

        let block = self.flash.get(victim);
        let lun = block.address().lun_index(&self.config);
        let valid = block.valid_count();
        let pages: Vec<(Address, Option<Lpn>)> = block
            .pages()
            .filter(|(_, p)| p.state == PageState::Valid)
            .map(|(offset, p)| (block.page_address(offset), p.logical))
            .collect();

        debug!(
            "{:?} of block {} started: {} valid, {} invalid",
            kind,
            block.address(),
            valid,
            block.invalid_count()
        );
        self.pool.reserve_gc_pages(valid);
        self.gc.in_flight.insert(victim, InFlight { remaining: valid, lun });
        self.gc.lun_in_progress[lun] += 1;
        match kind {
            GcKind::Reclaim => self.stats.gc_started += 1,
            GcKind::WearLeveling => self.stats.wear_leveling_started += 1,
        }

        if valid == 0 {
            return self.request_erase(victim, io);
        }
        for (source, logical) in pages {
            let lpn = io
                .ftl
                .resolve_logical_address(&source)
                .or(logical)
                .ok_or(Error::MissingLpn(source))?;
            self.dispatch_migration(PendingMigration { victim, source, lpn, kind }, io)?;
        }
        Ok(())
    }

    /// Finds a destination for `m` and issues its read, or parks it behind
    /// the write currently in flight on the destination block.
    fn dispatch_migration(&mut self, m: PendingMigration, io: &mut Io<'_>) -> Result<()> {
        if self.flash.page_state(&m.source)? != PageState::Valid {
            // overwritten or trimmed while queued, nothing left to move
            self.stats.stale_migrations += 1;
            self.pool.release_gc_pages(1);
            return self.complete_migration(m.victim, io);
        }

        let (channel, die) = (m.source.channel, m.source.die);
        let mut dest = self.pool.allocate(Some(channel), Some(die), None, &self.flash);
        if dest.is_none() {
            dest = self.pool.allocate(None, None, None, &self.flash);
        }
        if dest.is_none() {
            let lun = m.source.lun_index(&self.config);
            let busy = self
                .pool
                .pointer(lun)
                .or_else(|| (0..self.config.luns()).find_map(|l| self.pool.pointer(l)));
            match busy {
                Some(pointer) => {
                    trace!("migration of {} waits on block {}", m.source, pointer);
                    self.gc.dependents.push(pointer.block_index(&self.config), m);
                }
                None => {
                    warn!("no pointer anywhere, migration of {} waits for an erase", m.source);
                    self.gc.dependents.push_unplaced(m);
                }
            }
            return Ok(());
        }

        let mode = if dest.same_lun(&m.source) && self.gc.copy_back.allows(m.lpn) {
            self.gc.copy_back.record(m.lpn);
            MigrationMode::CopyBack
        } else {
            self.gc.copy_back.reset(m.lpn);
            MigrationMode::ReadWrite
        };
        self.pool.reserve(&dest);

        let migration = Migration {
            victim: m.victim,
            source: m.source,
            lpn: m.lpn,
            dest,
            mode,
            kind: m.kind,
        };
        trace!("migrate lpn {} {} -> {} ({:?})", m.lpn, m.source, dest, mode);
        io.scheduler.schedule(Operation::migration_read(migration));
        Ok(())
    }

    pub(crate) fn on_migration_read(&mut self, m: &Migration, io: &mut Io<'_>) -> Result<()> {
        io.scheduler.schedule(Operation::migration_write(*m));
        Ok(())
    }

    pub(crate) fn on_migration_written(&mut self, m: &Migration, io: &mut Io<'_>) -> Result<()> {
        self.program(&m.dest, m.lpn)?;

        if self.flash.page_state(&m.source)? == PageState::Valid {
            match io.ftl.commit_new_mapping(m.lpn, m.dest) {
                Some(old) if old == m.source => self.on_trim_or_supersede(&old, io)?,
                found => {
                    return Err(Error::MappingMismatch {
                        lpn: m.lpn,
                        expected: m.source,
                        found,
                    })
                }
            }
        } else {
            // the data changed while it was being copied
            self.stats.stale_migrations += 1;
            self.on_trim_or_supersede(&m.dest, io)?;
        }
        self.stats.record_migration(m.kind, m.mode);

        self.complete_migration(m.victim, io)?;
        self.after_write(&m.dest, io)
    }

    fn complete_migration(&mut self, victim: BlockId, io: &mut Io<'_>) -> Result<()> {
        let Some(record) = self.gc.in_flight.get_mut(&victim) else {
            return Err(Error::NotReclaiming { block: victim });
        };
        record.remaining -= 1;
        if record.remaining > 0 {
            return Ok(());
        }
        let block = self.flash.get(victim);
        if block.state() != BlockState::Inactive {
            return Err(Error::UnfinishedMigration {
                block: victim,
                valid: block.valid_count(),
            });
        }
        self.request_erase(victim, io)
    }

    /// Releases migrations parked on `block` now that its write is done.
    /// They are re-dispatched in order, so the first one takes the pointer
    /// and the rest queue up behind it again.
    pub(crate) fn release_dependents(&mut self, block: BlockId, io: &mut Io<'_>) -> Result<()> {
        for m in self.gc.dependents.take(block) {
            self.dispatch_migration(m, io)?;
        }
        Ok(())
    }

    fn retry_unplaced(&mut self, io: &mut Io<'_>) -> Result<()> {
        for m in self.gc.dependents.take_unplaced() {
            self.dispatch_migration(m, io)?;
        }
        Ok(())
    }

    /// Queues an erase. A channel runs one erase at a time; the rest wait in
    /// FIFO order.
    pub(crate) fn request_erase(&mut self, block: BlockId, io: &mut Io<'_>) -> Result<()> {
        if !self.gc.erasing.insert(block) {
            return Err(Error::AlreadyReclaiming { block });
        }
        self.candidates.unregister(block);

        let address = self.flash.get(block).address();
        let channel = address.channel;
        if self.gc.erase_running[channel].is_none() {
            self.gc.erase_running[channel] = Some(block);
            debug!("erase {} issued", address);
            io.scheduler.schedule(Operation::erase(address));
        } else {
            debug!("erase {} queued behind channel {}", address, channel);
            self.gc.erase_queue[channel].push_back(block);
        }
        Ok(())
    }

    pub(crate) fn on_erase_completed(&mut self, block: BlockId, io: &mut Io<'_>) -> Result<()> {
        let address = self.flash.get(block).address();
        let channel = address.channel;
        if self.gc.erase_running[channel] != Some(block) {
            return Err(Error::NotReclaiming { block });
        }
        self.gc.erase_running[channel] = None;
        self.gc.erasing.remove(&block);
        self.flash.get_mut(block).erase()?;

        match self.gc.in_flight.remove(&block) {
            Some(record) => {
                self.gc.lun_in_progress[record.lun] -= 1;
                self.stats.gc_erases += 1;
            }
            None => self.stats.implicit_erases += 1,
        }
        self.pool.on_erase_completed(block, &mut self.flash);
        if self.pool.is_retired(block) {
            self.stats.retired_blocks += 1;
        }

        if let Some(next) = self.gc.erase_queue[channel].pop_front() {
            let next_address = self.flash.get(next).address();
            self.gc.erase_running[channel] = Some(next);
            debug!("erase {} released", next_address);
            io.scheduler.schedule(Operation::erase(next_address));
        }

        self.retry_unplaced(io)?;
        self.maybe_wear_level(io)?;
        self.check_gc_triggers(address.lun_index(&self.config), io)
    }

    /// Relocates the data of a youngest block once wear has spread too far,
    /// so the block rejoins the erase rotation.
    fn maybe_wear_level(&mut self, io: &mut Io<'_>) -> Result<()> {
        let Some(threshold) = self.config.wear_leveling_threshold else {
            return Ok(());
        };
        if self.pool.max_age() - self.pool.min_age() <= threshold
            || self.gc.in_progress() >= self.config.max_concurrent_gc
        {
            return Ok(());
        }

        let min_age = self.pool.min_age();
        let victim = self
            .flash
            .blocks()
            .iter()
            .find(|b| {
                b.age() == min_age
                    && b.state() == BlockState::Active
                    && !self.gc.is_reclaiming(b.index())
                    && !self.gc.is_erasing(b.index())
                    && !self.gc.lun_busy(b.address().lun_index(&self.config))
                    && b.valid_count() <= self.pool.available_for_new_writes()
            })
            .map(|b| b.index());

        if let Some(victim) = victim {
            debug!(
                "wear spread {}..{} exceeds {}, relocating block {}",
                min_age,
                self.pool.max_age(),
                threshold,
                self.flash.get(victim).address()
            );
            self.start_reclaim(victim, GcKind::WearLeveling, io)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Time;
    use crate::ftl::{AddressTranslator, PageMap};
    use crate::ops::{OpKind, Scheduler};

    /// Hands operations back in submission order. `bias` inflates the load
    /// of a LUN so writes are steered away from it.
    #[derive(Default)]
    struct Recorder {
        ops: VecDeque<Operation>,
        bias: Vec<usize>,
    }

    impl Scheduler for Recorder {
        fn schedule(&mut self, op: Operation) {
            self.ops.push_back(op);
        }

        fn now(&self) -> Time {
            0
        }

        fn lun_load(&self, lun: usize) -> usize {
            self.bias.get(lun).copied().unwrap_or(0)
        }
    }

    struct Rig {
        controller: Controller,
        ftl: PageMap,
        sched: Recorder,
    }

    impl Rig {
        fn new(config: Config) -> Self {
            Rig {
                ftl: PageMap::new(&config),
                controller: Controller::new(&config).unwrap(),
                sched: Recorder::default(),
            }
        }

        /// Allocates and completes an application write in one go.
        fn write(&mut self, lpn: Lpn) -> Address {
            let mut io = Io {
                scheduler: &mut self.sched,
                ftl: &mut self.ftl,
            };
            let address = self.controller.allocate_for_write(lpn, &mut io).unwrap();
            assert!(!address.is_none(), "no page for lpn {}", lpn);
            self.controller
                .register_write_outcome(&Operation::write(address, lpn), &mut io)
                .unwrap();
            address
        }

        fn trim(&mut self, lpn: Lpn) {
            let mut io = Io {
                scheduler: &mut self.sched,
                ftl: &mut self.ftl,
            };
            self.controller.register_trim(lpn, &mut io).unwrap();
        }

        fn gc(&mut self, scope: GcScope) -> GcOutcome {
            let mut io = Io {
                scheduler: &mut self.sched,
                ftl: &mut self.ftl,
            };
            self.controller.schedule_gc(scope, &mut io).unwrap()
        }

        fn step(&mut self) -> Option<Operation> {
            let op = self.sched.ops.pop_front()?;
            let mut io = Io {
                scheduler: &mut self.sched,
                ftl: &mut self.ftl,
            };
            match op.kind {
                OpKind::Read | OpKind::CopyBackRead => self.controller.register_read_outcome(&op, &mut io),
                OpKind::Write | OpKind::CopyBack => self.controller.register_write_outcome(&op, &mut io),
                OpKind::Erase => self.controller.register_erase_outcome(&op, &mut io),
            }
            .unwrap();
            Some(op)
        }

        fn run(&mut self) {
            while self.step().is_some() {}
        }
    }

    fn config() -> Config {
        Config {
            channels: 2,
            dies_per_channel: 1,
            planes_per_die: 1,
            blocks_per_plane: 8,
            pages_per_block: 4,
            gc_reserve_blocks: 1,
            greed_scale: 0,
            over_provisioning: 25.0,
            ..Config::default()
        }
    }

    #[test]
    fn erase_waits_for_every_migration() {
        let mut rig = Rig::new(config());
        for lpn in 0..4 {
            rig.write(lpn);
        }
        rig.trim(0);
        assert_eq!(rig.gc(GcScope::lun(0, 0)), GcOutcome::Started { victim: 0 });
        assert_eq!(rig.controller.gc_state().remaining(0), Some(3));
        assert!(!rig.controller.candidates().contains(0));
        // two pointers are free, the third page waits on the first one
        assert_eq!(rig.controller.gc_state().queued_migrations(), 1);

        let mut written = 0;
        while let Some(op) = rig.step() {
            match op.kind {
                OpKind::Write => {
                    assert!(op.is_gc());
                    written += 1;
                }
                OpKind::Erase => assert_eq!(written, 3),
                _ => {}
            }
        }
        assert_eq!(written, 3);

        let block = rig.controller.flash().get(0);
        assert_eq!(block.state(), BlockState::Free);
        assert_eq!((block.valid_count(), block.invalid_count()), (0, 0));
        assert_eq!(rig.controller.stats().gc_erases, 1);
        assert_eq!(rig.controller.stats().gc_pages_migrated, 3);
        assert_eq!(rig.controller.how_many_reclamations_in_progress(), 0);
        for lpn in 1..4 {
            let at = rig.ftl.lookup(lpn).unwrap();
            assert_ne!(at.block_index(rig.controller.config()), 0);
        }
    }

    #[test]
    fn victim_too_large_for_budget_stays_a_candidate() {
        let mut rig = Rig::new(config());
        for lpn in 0..4 {
            rig.write(lpn);
        }
        rig.trim(0);
        let spare = rig.controller.pool.available_for_new_writes() - 2;
        rig.controller.pool.reserve_gc_pages(spare);

        assert_eq!(
            rig.gc(GcScope::lun(0, 0)),
            GcOutcome::Cancelled(CancelReason::NotEnoughFreeSpace)
        );
        assert!(rig.controller.candidates().contains(0));
        assert!(rig.sched.ops.is_empty());
        assert_eq!(rig.controller.stats().cancelled_no_space, 1);
    }

    #[test]
    fn one_reclamation_per_lun() {
        let mut rig = Rig::new(config());
        for lpn in 0..8 {
            rig.write(lpn);
        }
        rig.trim(0);
        rig.trim(4);
        assert_eq!(rig.gc(GcScope::lun(0, 0)), GcOutcome::Started { victim: 0 });
        assert_eq!(
            rig.gc(GcScope::lun(0, 0)),
            GcOutcome::Cancelled(CancelReason::AlreadyHappening)
        );
        assert_eq!(
            rig.gc(GcScope::block(1)),
            GcOutcome::Cancelled(CancelReason::AlreadyHappening)
        );
        assert_eq!(rig.controller.stats().cancelled_already_happening, 2);
        assert!(rig.controller.candidates().contains(1));
    }

    #[test]
    fn concurrency_cap_defers() {
        let mut rig = Rig::new(Config {
            max_concurrent_gc: 1,
            ..config()
        });
        for lpn in 0..4 {
            rig.write(lpn);
        }
        rig.sched.bias = vec![1, 0];
        for lpn in 4..8 {
            assert_eq!(rig.write(lpn).channel, 1);
        }
        rig.trim(0);
        rig.trim(4);

        assert_eq!(rig.gc(GcScope::lun(0, 0)), GcOutcome::Started { victim: 0 });
        assert_eq!(rig.gc(GcScope::lun(1, 0)), GcOutcome::Deferred);
        assert_eq!(rig.controller.stats().deferred, 1);
        assert!(rig.controller.candidates().contains(8));
    }

    #[test]
    fn free_or_filling_block_is_skipped() {
        let mut rig = Rig::new(config());
        rig.write(0);
        assert_eq!(rig.gc(GcScope::block(0)), GcOutcome::Skipped);
        assert_eq!(rig.gc(GcScope::block(5)), GcOutcome::Skipped);
        assert_eq!(
            rig.gc(GcScope::ANY),
            GcOutcome::Cancelled(CancelReason::NoCandidate)
        );
    }

    #[test]
    fn erases_serialize_per_channel() {
        let mut rig = Rig::new(Config {
            channels: 1,
            dies_per_channel: 2,
            ..config()
        });
        for lpn in 0..4 {
            rig.write(lpn);
        }
        rig.sched.bias = vec![1, 0];
        for lpn in 4..8 {
            assert_eq!(rig.write(lpn).die, 1);
        }

        for lpn in 0..8 {
            rig.trim(lpn);
        }
        let gc = rig.controller.gc_state();
        assert_eq!(gc.running_erase(0), Some(0));
        assert_eq!(gc.queued_erases(0), 1);
        assert_eq!(rig.sched.ops.len(), 1);

        assert_eq!(rig.step().map(|op| op.kind), Some(OpKind::Erase));
        assert_eq!(rig.controller.gc_state().running_erase(0), Some(8));
        assert_eq!(rig.sched.ops.len(), 1);
        rig.run();

        assert_eq!(rig.controller.stats().implicit_erases, 2);
        assert_eq!(rig.controller.stats().gc_started, 0);
        assert_eq!(rig.controller.gc_state().running_erase(0), None);
    }

    #[test]
    fn stale_migrations_are_dropped() {
        let mut rig = Rig::new(config());
        for lpn in 0..4 {
            rig.write(lpn);
        }
        rig.trim(0);
        assert_eq!(rig.gc(GcScope::lun(0, 0)), GcOutcome::Started { victim: 0 });

        // lpn 3 is still queued, lpn 2 already has its read in flight
        rig.trim(3);
        rig.trim(2);
        assert!(!rig.controller.candidates().contains(0));
        rig.run();

        let stats = rig.controller.stats();
        assert_eq!(stats.stale_migrations, 2);
        assert_eq!(stats.gc_erases, 1);
        assert_eq!(rig.ftl.lookup(2), None);
        assert_eq!(rig.ftl.lookup(3), None);
        assert!(rig.ftl.lookup(1).is_some());
        let pool = rig.controller.pool();
        assert_eq!(pool.available_for_new_writes(), pool.free_pages());
    }

    #[test]
    fn copy_back_is_bounded_per_address() {
        let mut rig = Rig::new(Config {
            copy_back: CopyBackConfig {
                max_repeats: 1,
                ..CopyBackConfig::default()
            },
            ..config()
        });
        for lpn in 0..4 {
            rig.write(lpn);
        }
        rig.trim(0);
        rig.gc(GcScope::lun(0, 0));
        // same-LUN destination for lpn 1, the other LUN for lpn 2
        let kinds: Vec<_> = rig.sched.ops.iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OpKind::CopyBackRead, OpKind::Read]);
        rig.run();
        assert_eq!(rig.controller.gc_state().copy_backs(1), 1);
        assert_eq!(rig.controller.gc_state().copy_backs(2), 0);
        assert!(rig.controller.stats().copy_backs >= 1);

        // lpn 1 sits in block 1 now; fill it and reclaim it again
        assert_eq!(rig.ftl.lookup(1).map(|a| a.block), Some(1));
        while rig.controller.flash().get(1).state() != BlockState::Active {
            let lpn = 10 + rig.controller.flash().get(1).next_page();
            rig.write(lpn);
        }
        let garbage = rig.controller.flash().get(1).page(3).logical.unwrap();
        rig.trim(garbage);
        assert_eq!(rig.gc(GcScope::block(1)), GcOutcome::Started { victim: 1 });

        let first = rig.sched.ops.front().cloned().unwrap();
        assert_eq!(first.lpn, Some(1));
        assert_eq!(first.kind, OpKind::Read);
        assert_eq!(rig.controller.gc_state().copy_backs(1), 0);
        rig.run();
    }

    #[test]
    fn copy_back_counter_limits() {
        let mut counter = CopyBackCounter::new(&CopyBackConfig {
            max_repeats: 2,
            max_tracked_addresses: 1,
        });
        assert!(counter.allows(5));
        counter.record(5);
        counter.record(5);
        assert!(!counter.allows(5));
        assert!(!counter.allows(6));
        counter.reset(5);
        assert_eq!(counter.count(5), 0);
        assert!(counter.allows(6));

        let disabled = CopyBackCounter::new(&CopyBackConfig::default());
        assert!(!disabled.allows(1));
    }

    #[test]
    fn wear_spread_relocates_youngest_block() {
        let mut rig = Rig::new(Config {
            wear_leveling_threshold: Some(0),
            ..config()
        });
        for lpn in 0..8 {
            rig.write(lpn);
        }
        for lpn in 0..4 {
            rig.trim(lpn);
        }
        assert_eq!(rig.step().map(|op| op.kind), Some(OpKind::Erase));

        assert_eq!(rig.controller.stats().wear_leveling_started, 1);
        assert_eq!(rig.controller.gc_state().remaining(1), Some(4));

        let mut steps = 0;
        while rig.controller.gc_state().is_reclaiming(1) || rig.controller.gc_state().is_erasing(1) {
            assert!(rig.step().is_some());
            steps += 1;
            assert!(steps < 100);
        }
        assert_eq!(rig.controller.flash().get(1).state(), BlockState::Free);
        assert_eq!(rig.controller.flash().get(1).age(), 1);
        assert!(rig.controller.stats().wear_leveling_pages_migrated >= 4);
        for lpn in 4..8 {
            assert!(rig.ftl.lookup(lpn).is_some());
        }
    }

    #[test]
    fn broken_bookkeeping_is_fatal() {
        let mut rig = Rig::new(config());
        for lpn in 0..4 {
            rig.write(lpn);
        }
        rig.trim(0);
        rig.gc(GcScope::lun(0, 0));

        let mut io = Io {
            scheduler: &mut rig.sched,
            ftl: &mut rig.ftl,
        };
        assert!(matches!(
            rig.controller.start_reclaim(0, GcKind::Reclaim, &mut io),
            Err(Error::AlreadyReclaiming { block: 0 })
        ));
        let stray = Operation::erase(Address::page(1, 0, 0, 3, 0));
        assert!(matches!(
            rig.controller.register_erase_outcome(&stray, &mut io),
            Err(Error::NotReclaiming { block: 11 })
        ));
    }

    #[test]
    fn live_victim_after_last_migration_is_fatal() {
        let mut rig = Rig::new(config());
        for lpn in 0..4 {
            rig.write(lpn);
        }
        rig.trim(0);
        rig.gc(GcScope::lun(0, 0));
        // pretend only one of the three valid pages needed moving
        if let Some(record) = rig.controller.gc.in_flight.get_mut(&0) {
            record.remaining = 1;
        }

        loop {
            let op = rig.sched.ops.pop_front().unwrap();
            let mut io = Io {
                scheduler: &mut rig.sched,
                ftl: &mut rig.ftl,
            };
            if op.kind == OpKind::Read {
                rig.controller.register_read_outcome(&op, &mut io).unwrap();
                continue;
            }
            assert!(matches!(
                rig.controller.register_write_outcome(&op, &mut io),
                Err(Error::UnfinishedMigration { block: 0, valid: 2 })
            ));
            break;
        }
    }

    #[test]
    fn mapping_moved_under_migration_is_fatal() {
        let mut rig = Rig::new(config());
        for lpn in 0..4 {
            rig.write(lpn);
        }
        rig.trim(0);
        rig.gc(GcScope::lun(0, 0));
        let elsewhere = Address::page(1, 0, 0, 7, 3);
        rig.ftl.commit_new_mapping(1, elsewhere);

        let read = rig.sched.ops.pop_front().unwrap();
        assert_eq!(read.lpn, Some(1));
        rig.sched.ops.clear();
        let mut io = Io {
            scheduler: &mut rig.sched,
            ftl: &mut rig.ftl,
        };
        rig.controller.register_read_outcome(&read, &mut io).unwrap();
        let write = rig.sched.ops.pop_front().unwrap();
        let mut io = Io {
            scheduler: &mut rig.sched,
            ftl: &mut rig.ftl,
        };
        let err = rig.controller.register_write_outcome(&write, &mut io);
        assert!(matches!(
            err,
            Err(Error::MappingMismatch { lpn: 1, found: Some(found), .. }) if found == elsewhere
        ));
    }

    #[test]
    fn scope_outside_geometry_is_rejected() {
        let mut rig = Rig::new(config());
        let mut io = Io {
            scheduler: &mut rig.sched,
            ftl: &mut rig.ftl,
        };
        assert!(matches!(
            rig.controller.schedule_gc(GcScope::block(16), &mut io),
            Err(Error::AddressOutOfRange(_))
        ));
        assert!(matches!(
            rig.controller.schedule_gc(GcScope::lun(2, 0), &mut io),
            Err(Error::AddressOutOfRange(a)) if a == Address::lun(2, 0)
        ));
        assert!(matches!(
            rig.controller.schedule_gc(GcScope::lun(0, 1), &mut io),
            Err(Error::AddressOutOfRange(_))
        ));
        assert_eq!(rig.controller.stats().cancelled_no_candidate, 0);
    }
}
