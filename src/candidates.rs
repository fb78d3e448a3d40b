//! GC candidate tracking and victim selection.

use std::collections::BTreeSet;

use crate::config::{BlockId, Config};
use crate::media::{BlockState, Flash};

/// Scope of a reclamation request. `None` fields are wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcScope {
    pub channel: Option<usize>,
    pub die: Option<usize>,
    pub block: Option<BlockId>,
    pub age_class: Option<usize>,
}

impl GcScope {
    pub const ANY: GcScope = GcScope {
        channel: None,
        die: None,
        block: None,
        age_class: None,
    };

    pub fn lun(channel: usize, die: usize) -> Self {
        GcScope {
            channel: Some(channel),
            die: Some(die),
            ..GcScope::ANY
        }
    }

    pub fn block(block: BlockId) -> Self {
        GcScope {
            block: Some(block),
            ..GcScope::ANY
        }
    }

    pub fn is_unscoped(&self) -> bool {
        *self == GcScope::ANY
    }
}

/// Blocks eligible for reclamation, bucketed by (channel, die, age class).
pub struct CandidateTracker {
    config: Config,
    sets: Vec<BTreeSet<BlockId>>,
    /// Bucket each registered block currently sits in.
    registered: Vec<Option<usize>>,
}

impl CandidateTracker {
    pub fn new(config: &Config) -> Self {
        CandidateTracker {
            config: config.clone(),
            sets: vec![BTreeSet::new(); config.luns() * config.num_age_classes],
            registered: vec![None; config.total_blocks()],
        }
    }

    fn bucket(&self, lun: usize, age_class: usize) -> usize {
        lun * self.config.num_age_classes + age_class
    }

    fn lun_of(&self, block: BlockId) -> usize {
        block / self.config.blocks_per_lun()
    }

    /// Returns true when this insertion made the bucket non-empty.
    pub fn register(&mut self, block: BlockId, age_class: usize) -> bool {
        let bucket = self.bucket(self.lun_of(block), age_class);
        match self.registered[block] {
            Some(current) if current == bucket => return false,
            Some(_) => self.unregister(block),
            None => {}
        }
        let was_empty = self.sets[bucket].is_empty();
        self.sets[bucket].insert(block);
        self.registered[block] = Some(bucket);
        was_empty
    }

    pub fn unregister(&mut self, block: BlockId) {
        if let Some(bucket) = self.registered[block].take() {
            self.sets[bucket].remove(&block);
        }
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.registered[block].is_some()
    }

    pub fn len(&self) -> usize {
        self.sets.iter().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(BTreeSet::is_empty)
    }

    pub fn count_by_age_class(&self) -> Vec<usize> {
        let classes = self.config.num_age_classes;
        let mut counts = vec![0; classes];
        for (bucket, set) in self.sets.iter().enumerate() {
            counts[bucket % classes] += set.len();
        }
        counts
    }

    pub fn count_for_lun(&self, lun: usize) -> usize {
        (0..self.config.num_age_classes)
            .map(|class| self.sets[self.bucket(lun, class)].len())
            .sum()
    }

    /// Greedy selection: the `Active` block with the fewest valid pages in
    /// scope. An empty scoped query is retried once without any scope.
    pub fn select_victim(&self, scope: &GcScope, flash: &Flash) -> Option<BlockId> {
        if let Some(block) = scope.block {
            return self
                .contains(block)
                .then_some(block)
                .filter(|b| flash.get(*b).state() == BlockState::Active);
        }
        self.select_in(scope, flash).or_else(|| {
            if scope.is_unscoped() {
                None
            } else {
                self.select_in(&GcScope::ANY, flash)
            }
        })
    }

    fn select_in(&self, scope: &GcScope, flash: &Flash) -> Option<BlockId> {
        let dies = self.config.dies_per_channel;
        let mut best: Option<(usize, BlockId)> = None;
        for lun in 0..self.config.luns() {
            if scope.channel.is_some_and(|c| c != lun / dies) || scope.die.is_some_and(|d| d != lun % dies) {
                continue;
            }
            for class in 0..self.config.num_age_classes {
                if scope.age_class.is_some_and(|a| a != class) {
                    continue;
                }
                for &block in &self.sets[self.bucket(lun, class)] {
                    let b = flash.get(block);
                    if b.state() != BlockState::Active {
                        continue;
                    }
                    if best.map_or(true, |(valid, _)| b.valid_count() < valid) {
                        best = Some((b.valid_count(), block));
                    }
                }
            }
        }
        best.map(|(_, block)| block)
    }
}
