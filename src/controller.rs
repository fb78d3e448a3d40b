//! The flash controller: shared media state plus the completion surface the
//! scheduler and FTL call into.
//!
//! Every handler runs to completion on the simulation thread and leaves the
//! page/block state, the free pool, the candidate sets and the GC records
//! consistent with each other before it returns.

use log::{debug, warn};

use crate::address::Address;
use crate::candidates::{CandidateTracker, GcScope};
use crate::config::{BlockId, Config, Lpn};
use crate::error::{Error, Result};
use crate::ftl::AddressTranslator;
use crate::gc::{GcOutcome, GcState};
use crate::media::{BlockState, Flash};
use crate::ops::{Operation, Scheduler};
use crate::policy::{self, AllocationPolicy, PolicyView};
use crate::pool::FreePool;
use crate::stats::Stats;

/// The external collaborators a handler may call back into.
pub struct Io<'a> {
    pub scheduler: &'a mut dyn Scheduler,
    pub ftl: &'a mut dyn AddressTranslator,
}

pub struct Controller {
    pub(crate) config: Config,
    pub(crate) flash: Flash,
    pub(crate) pool: FreePool,
    pub(crate) candidates: CandidateTracker,
    pub(crate) gc: GcState,
    pub(crate) policy: Box<dyn AllocationPolicy>,
    pub(crate) stats: Stats,
}

impl Controller {
    pub fn new(config: &Config) -> Result<Self> {
        Controller::with_policy(config, policy::from_kind(config.policy))
    }

    pub fn with_policy(config: &Config, policy: Box<dyn AllocationPolicy>) -> Result<Self> {
        config.validate()?;
        let flash = Flash::new(config);
        let pool = FreePool::new(config, &flash);
        debug!("controller up with {} policy", policy.name());
        Ok(Controller {
            config: config.clone(),
            candidates: CandidateTracker::new(config),
            gc: GcState::new(config),
            flash,
            pool,
            policy,
            stats: Stats::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flash(&self) -> &Flash {
        &self.flash
    }

    pub fn pool(&self) -> &FreePool {
        &self.pool
    }

    pub fn candidates(&self) -> &CandidateTracker {
        &self.candidates
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Picks and reserves a page for an application write. Returns
    /// [`Address::NONE`] when nothing is writable right now; the caller
    /// stalls the write until a later completion frees space.
    pub fn allocate_for_write(&mut self, lpn: Lpn, io: &mut Io<'_>) -> Result<Address> {
        let view = PolicyView {
            config: &self.config,
            flash: &self.flash,
            pool: &self.pool,
            candidates: &self.candidates,
            scheduler: &*io.scheduler,
        };
        let mut address = self.policy.choose_best_address(&view, lpn);
        if address.is_none() {
            address = self.policy.choose_any_address(&view, lpn);
        }

        if address.is_none() {
            // busy pointers free up on their own, missing ones need an erase
            if (0..self.config.luns()).all(|lun| self.pool.pointer(lun).is_none()) {
                self.on_out_of_space(io)?;
            }
            return Ok(Address::NONE);
        }
        if !self.pool.reserve_app_page() {
            self.on_out_of_space(io)?;
            return Ok(Address::NONE);
        }
        self.pool.reserve(&address);
        Ok(address)
    }

    fn on_out_of_space(&mut self, io: &mut Io<'_>) -> Result<()> {
        if self.gc.in_progress() == 0 && !self.gc.erase_pending() {
            debug!("write stalled with no reclamation running, forcing GC");
            self.stats.emergency_triggers += 1;
            self.schedule_gc(GcScope::ANY, io)?;
        }
        Ok(())
    }

    pub fn register_write_outcome(&mut self, op: &Operation, io: &mut Io<'_>) -> Result<()> {
        if let Some(m) = op.migration {
            return self.on_migration_written(&m, io);
        }
        let lpn = op.lpn.ok_or(Error::MissingLpn(op.address))?;
        self.program(&op.address, lpn)?;
        self.stats.app_writes += 1;
        self.policy.on_write_committed(lpn);

        if let Some(old) = io.ftl.commit_new_mapping(lpn, op.address) {
            self.on_trim_or_supersede(&old, io)?;
        }
        self.after_write(&op.address, io)
    }

    pub fn register_read_outcome(&mut self, op: &Operation, io: &mut Io<'_>) -> Result<()> {
        match op.migration {
            Some(m) => self.on_migration_read(&m, io),
            None => {
                self.stats.app_reads += 1;
                Ok(())
            }
        }
    }

    pub fn register_erase_outcome(&mut self, op: &Operation, io: &mut Io<'_>) -> Result<()> {
        let block = self.flash.index_of(&op.address)?;
        self.on_erase_completed(block, io)
    }

    pub fn register_trim(&mut self, lpn: Lpn, io: &mut Io<'_>) -> Result<()> {
        self.stats.trims += 1;
        if let Some(old) = io.ftl.unmap(lpn) {
            self.on_trim_or_supersede(&old, io)?;
        }
        Ok(())
    }

    /// Programs one page and advances the pointer it came from.
    pub(crate) fn program(&mut self, address: &Address, lpn: Lpn) -> Result<()> {
        let block = self.flash.index_of(address)?;
        let state = self.flash.get_mut(block).write_page(address.page, lpn)?;
        self.pool.on_write_completed(address, &self.flash)?;
        // a block that filled up with garbage already in it is reclaimable
        if state == BlockState::Active && self.flash.get(block).invalid_count() > 0 {
            self.register_candidate(block)?;
        }
        Ok(())
    }

    /// Bookkeeping shared by application and migration writes once the
    /// mapping is settled.
    pub(crate) fn after_write(&mut self, address: &Address, io: &mut Io<'_>) -> Result<()> {
        let block = self.flash.index_of(address)?;
        self.release_dependents(block, io)?;
        self.check_gc_triggers(address.lun_index(&self.config), io)
    }

    /// Invalidates the page at `old`, registers its block for reclamation and
    /// erases the block at once if nothing valid is left in it.
    pub fn on_trim_or_supersede(&mut self, old: &Address, io: &mut Io<'_>) -> Result<()> {
        let block = self.flash.index_of(old)?;
        let state = self.flash.get_mut(block).invalidate_page(old.page)?;
        if self.gc.is_reclaiming(block) || self.gc.is_erasing(block) {
            return Ok(());
        }
        match state {
            BlockState::Inactive => {
                self.candidates.unregister(block);
                self.request_erase(block, io)
            }
            BlockState::Active => {
                if self.register_candidate(block)? {
                    self.check_gc_triggers(old.lun_index(&self.config), io)?;
                }
                Ok(())
            }
            BlockState::Free | BlockState::PartiallyFree => Ok(()),
        }
    }

    /// Returns true when the block's bucket just became non-empty.
    fn register_candidate(&mut self, block: BlockId) -> Result<bool> {
        if self.gc.is_reclaiming(block) {
            return Err(Error::AlreadyReclaiming { block });
        }
        if self.candidates.contains(block) {
            return Ok(false);
        }
        let class = self.pool.age_class_of(self.flash.get(block).age());
        self.flash.get_mut(block).age_class = class;
        Ok(self.candidates.register(block, class))
    }

    /// Asks the policy whether `lun` needs GC, then applies the global
    /// low-space backstop.
    pub(crate) fn check_gc_triggers(&mut self, lun: usize, io: &mut Io<'_>) -> Result<()> {
        let view = PolicyView {
            config: &self.config,
            flash: &self.flash,
            pool: &self.pool,
            candidates: &self.candidates,
            scheduler: &*io.scheduler,
        };
        if let Some(scope) = self.policy.check_trigger_gc(&view, lun) {
            self.schedule_gc(scope, io)?;
        }

        if self.pool.is_emergency() && self.gc.in_progress() == 0 {
            warn!(
                "only {} free pages left, triggering emergency GC",
                self.pool.free_pages()
            );
            self.stats.emergency_triggers += 1;
            self.schedule_gc(GcScope::ANY, io)?;
        }
        Ok(())
    }

    pub fn how_many_reclamations_in_progress(&self) -> usize {
        self.gc.in_progress()
    }

    pub fn may_reclaim(&self, block: BlockId, io: &Io<'_>) -> bool {
        let view = PolicyView {
            config: &self.config,
            flash: &self.flash,
            pool: &self.pool,
            candidates: &self.candidates,
            scheduler: &*io.scheduler,
        };
        self.policy.may_reclaim(&view, block, io.scheduler.now())
    }

    /// Requests a reclamation in `scope`; see [`GcOutcome`] for results.
    pub fn schedule_gc(&mut self, scope: GcScope, io: &mut Io<'_>) -> Result<GcOutcome> {
        self.try_reclaim(scope, io)
    }
}
