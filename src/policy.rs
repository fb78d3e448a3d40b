//! Allocation and GC-triggering strategies.
//!
//! A policy only decides *where* an application write goes and *when* to ask
//! for reclamation. The free pool, the candidate tracker and the migration
//! orchestrator stay shared, so every policy is held to the same contract:
//! pages in a block are handed out in order and an exhausted pointer is
//! swapped exactly once.

use std::collections::HashMap;

use crate::address::Address;
use crate::candidates::{CandidateTracker, GcScope};
use crate::config::{BlockId, Config, Lpn, PolicyKind, Time};
use crate::media::Flash;
use crate::ops::Scheduler;
use crate::pool::FreePool;

/// Read-only view of the shared state a policy decides on.
pub struct PolicyView<'a> {
    pub config: &'a Config,
    pub flash: &'a Flash,
    pub pool: &'a FreePool,
    pub candidates: &'a CandidateTracker,
    pub scheduler: &'a dyn Scheduler,
}

impl PolicyView<'_> {
    /// Usable pointer on the least loaded LUN.
    pub fn least_loaded(&self, age_class: Option<usize>) -> Address {
        (0..self.config.luns())
            .filter_map(|lun| {
                let pointer = self.pool.usable_pointer(lun)?;
                let class = self.flash.get(pointer.block_index(self.config)).age_class;
                if age_class.is_some_and(|wanted| wanted != class) {
                    return None;
                }
                Some((self.scheduler.lun_load(lun), pointer))
            })
            .min_by_key(|(load, _)| *load)
            .map_or(Address::NONE, |(_, pointer)| pointer)
    }
}

pub trait AllocationPolicy {
    fn name(&self) -> &'static str;

    /// Preferred destination for a write of `lpn`, or [`Address::NONE`].
    fn choose_best_address(&mut self, view: &PolicyView<'_>, lpn: Lpn) -> Address;

    /// Fallback when the preferred scope has no room.
    fn choose_any_address(&mut self, view: &PolicyView<'_>, _lpn: Lpn) -> Address {
        view.least_loaded(None)
    }

    /// An application write of `lpn` has landed on flash. Allocation
    /// attempts that came back empty never reach this.
    fn on_write_committed(&mut self, _lpn: Lpn) {}

    /// Called after writes and erases on `lun` and when a candidate bucket
    /// becomes non-empty.
    fn check_trigger_gc(&mut self, view: &PolicyView<'_>, lun: usize) -> Option<GcScope> {
        let dies = view.config.dies_per_channel;
        if view.pool.free_block_count(lun) < view.config.greed_scale && view.candidates.count_for_lun(lun) > 0 {
            return Some(GcScope::lun(lun / dies, lun % dies));
        }
        None
    }

    /// Last say before a victim is committed to.
    /// The default refuses when no LUN has a pointer to migrate into.
    fn may_reclaim(&self, view: &PolicyView<'_>, _block: BlockId, _time: Time) -> bool {
        (0..view.config.luns()).any(|lun| view.pool.pointer(lun).is_some())
    }
}

pub fn from_kind(kind: PolicyKind) -> Box<dyn AllocationPolicy> {
    match kind {
        PolicyKind::ShortestQueue => Box::new(ShortestQueue),
        PolicyKind::HotCold => Box::new(HotCold::default()),
    }
}

/// Sends every write to the LUN with the shortest queue.
#[derive(Debug, Default)]
pub struct ShortestQueue;

impl AllocationPolicy for ShortestQueue {
    fn name(&self) -> &'static str {
        "shortest_queue"
    }

    fn choose_best_address(&mut self, view: &PolicyView<'_>, _lpn: Lpn) -> Address {
        view.least_loaded(None)
    }
}

/// Separates frequently rewritten pages from the rest: hot pages go to the
/// youngest age class, cold pages to the oldest, so wear evens out.
#[derive(Debug)]
pub struct HotCold {
    writes: HashMap<Lpn, u32>,
    hot_threshold: u32,
    decay_every: u64,
    seen: u64,
}

impl Default for HotCold {
    fn default() -> Self {
        HotCold {
            writes: HashMap::new(),
            hot_threshold: 3,
            decay_every: 1 << 16,
            seen: 0,
        }
    }
}

impl HotCold {
    pub fn is_hot(&self, lpn: Lpn) -> bool {
        self.write_count(lpn) >= self.hot_threshold
    }

    pub fn write_count(&self, lpn: Lpn) -> u32 {
        self.writes.get(&lpn).copied().unwrap_or(0)
    }

    fn record(&mut self, lpn: Lpn) {
        *self.writes.entry(lpn).or_insert(0) += 1;
        self.seen += 1;
        if self.seen % self.decay_every == 0 {
            self.writes.retain(|_, n| {
                *n /= 2;
                *n > 0
            });
        }
    }
}

impl AllocationPolicy for HotCold {
    fn name(&self) -> &'static str {
        "hot_cold"
    }

    fn choose_best_address(&mut self, view: &PolicyView<'_>, lpn: Lpn) -> Address {
        let class = if self.is_hot(lpn) {
            0
        } else {
            view.config.num_age_classes - 1
        };
        view.least_loaded(Some(class))
    }

    fn on_write_committed(&mut self, lpn: Lpn) {
        self.record(lpn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Operation;

    struct Loads(Vec<usize>);

    impl Scheduler for Loads {
        fn schedule(&mut self, _op: Operation) {}

        fn now(&self) -> Time {
            0
        }

        fn lun_load(&self, lun: usize) -> usize {
            self.0[lun]
        }
    }

    fn config() -> Config {
        Config {
            channels: 2,
            dies_per_channel: 1,
            planes_per_die: 1,
            blocks_per_plane: 4,
            pages_per_block: 4,
            num_age_classes: 2,
            greed_scale: 4,
            ..Config::default()
        }
    }

    #[test]
    fn shortest_queue_prefers_idle_lun() {
        let config = config();
        let flash = Flash::new(&config);
        let pool = FreePool::new(&config, &flash);
        let candidates = CandidateTracker::new(&config);
        let loads = Loads(vec![3, 1]);
        let view = PolicyView {
            config: &config,
            flash: &flash,
            pool: &pool,
            candidates: &candidates,
            scheduler: &loads,
        };
        assert_eq!(ShortestQueue.choose_best_address(&view, 0), Address::page(1, 0, 0, 0, 0));
    }

    #[test]
    fn hot_cold_routes_by_frequency() {
        let config = config();
        let flash = Flash::new(&config);
        let pool = FreePool::new(&config, &flash);
        let candidates = CandidateTracker::new(&config);
        let loads = Loads(vec![0, 0]);
        let view = PolicyView {
            config: &config,
            flash: &flash,
            pool: &pool,
            candidates: &candidates,
            scheduler: &loads,
        };
        let mut policy = HotCold::default();
        // every fresh block is in class 0, which is where hot pages go
        assert!(policy.choose_best_address(&view, 9).is_none());
        policy.on_write_committed(9);
        policy.on_write_committed(9);
        assert!(policy.choose_best_address(&view, 9).is_none());
        policy.on_write_committed(9);
        assert!(!policy.choose_best_address(&view, 9).is_none());
        assert!(policy.is_hot(9));
        assert!(!policy.choose_any_address(&view, 5).is_none());
    }

    #[test]
    fn hot_cold_counts_writes_not_lookups() {
        let config = config();
        let flash = Flash::new(&config);
        let pool = FreePool::new(&config, &flash);
        let candidates = CandidateTracker::new(&config);
        let loads = Loads(vec![0, 0]);
        let view = PolicyView {
            config: &config,
            flash: &flash,
            pool: &pool,
            candidates: &candidates,
            scheduler: &loads,
        };
        let mut policy = HotCold::default();
        for _ in 0..5 {
            policy.choose_best_address(&view, 4);
        }
        assert_eq!(policy.write_count(4), 0);
        policy.on_write_committed(4);
        assert_eq!(policy.write_count(4), 1);
        assert!(!policy.is_hot(4));
    }

    #[test]
    fn triggers_only_with_candidates_and_low_free_blocks() {
        let config = config();
        let flash = Flash::new(&config);
        let pool = FreePool::new(&config, &flash);
        let mut candidates = CandidateTracker::new(&config);
        let loads = Loads(vec![0, 0]);
        let mut policy = ShortestQueue;
        {
            let view = PolicyView {
                config: &config,
                flash: &flash,
                pool: &pool,
                candidates: &candidates,
                scheduler: &loads,
            };
            assert_eq!(policy.check_trigger_gc(&view, 1), None);
        }
        candidates.register(5, 0);
        let view = PolicyView {
            config: &config,
            flash: &flash,
            pool: &pool,
            candidates: &candidates,
            scheduler: &loads,
        };
        assert_eq!(policy.check_trigger_gc(&view, 1), Some(GcScope::lun(1, 0)));
        assert!(policy.may_reclaim(&view, 5, 0));
    }
}
