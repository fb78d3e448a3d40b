//! A small discrete-event driver around the controller.
//!
//! Each LUN executes one operation at a time with fixed latencies. Completion
//! events are delivered in timestamp order; application writes that cannot
//! get a page wait in a FIFO and are retried after every completion.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use log::{debug, warn};

use crate::address::Address;
use crate::candidates::GcScope;
use crate::config::{Config, Latencies, Lpn, Time};
use crate::controller::{Controller, Io};
use crate::error::{Error, Result};
use crate::ftl::{AddressTranslator, PageMap};
use crate::gc::GcOutcome;
use crate::ops::{OpKind, Operation, Scheduler};

struct Scheduled {
    time: Time,
    seq: u64,
    op: Operation,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.time, self.seq) == (other.time, other.seq)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

pub struct EventQueue {
    config: Config,
    latencies: Latencies,
    now: Time,
    seq: u64,
    heap: BinaryHeap<Reverse<Scheduled>>,
    lun_busy_until: Vec<Time>,
    lun_outstanding: Vec<usize>,
}

impl EventQueue {
    pub fn new(config: &Config) -> Self {
        EventQueue {
            config: config.clone(),
            latencies: config.latencies,
            now: 0,
            seq: 0,
            heap: BinaryHeap::new(),
            lun_busy_until: vec![0; config.luns()],
            lun_outstanding: vec![0; config.luns()],
        }
    }

    fn latency(&self, kind: OpKind) -> Time {
        match kind {
            OpKind::Read | OpKind::CopyBackRead => self.latencies.read,
            OpKind::Write => self.latencies.write,
            OpKind::CopyBack => self.latencies.copy_back,
            OpKind::Erase => self.latencies.erase,
        }
    }

    pub fn pop(&mut self) -> Option<Operation> {
        let Reverse(next) = self.heap.pop()?;
        self.now = next.time;
        self.lun_outstanding[next.op.address.lun_index(&self.config)] -= 1;
        Some(next.op)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Scheduler for EventQueue {
    fn schedule(&mut self, op: Operation) {
        let lun = op.address.lun_index(&self.config);
        let start = self.now.max(self.lun_busy_until[lun]);
        let done = start + self.latency(op.kind);
        self.lun_busy_until[lun] = done;
        self.lun_outstanding[lun] += 1;
        self.seq += 1;
        self.heap.push(Reverse(Scheduled {
            time: done,
            seq: self.seq,
            op,
        }));
    }

    fn now(&self) -> Time {
        self.now
    }

    fn lun_load(&self, lun: usize) -> usize {
        self.lun_outstanding[lun]
    }
}

pub struct Simulator {
    config: Config,
    controller: Controller,
    ftl: PageMap,
    queue: EventQueue,
    stalled: VecDeque<Lpn>,
    app_in_flight: usize,
}

impl Simulator {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Simulator::with_controller(Controller::new(config)?))
    }

    pub fn with_controller(controller: Controller) -> Self {
        let config = controller.config().clone();
        Simulator {
            ftl: PageMap::new(&config),
            queue: EventQueue::new(&config),
            config,
            controller,
            stalled: VecDeque::new(),
            app_in_flight: 0,
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn ftl(&self) -> &PageMap {
        &self.ftl
    }

    pub fn now(&self) -> Time {
        self.queue.now()
    }

    pub fn get_max_lba(&self) -> Lpn {
        self.ftl.get_max_lba()
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn stalled_writes(&self) -> usize {
        self.stalled.len()
    }

    /// Submits an application write and processes events until the number
    /// of outstanding writes fits the configured queue depth.
    pub fn write(&mut self, lpn: Lpn) -> Result<()> {
        self.stalled.push_back(lpn);
        self.dispatch_stalled()?;
        while self.app_in_flight + self.stalled.len() > self.config.queue_depth {
            self.step()?;
        }
        Ok(())
    }

    pub fn trim(&mut self, lpn: Lpn) -> Result<()> {
        let mut io = Io {
            scheduler: &mut self.queue,
            ftl: &mut self.ftl,
        };
        self.controller.register_trim(lpn, &mut io)
    }

    /// Reads a mapped page. Unmapped pages return without touching flash.
    pub fn read(&mut self, lpn: Lpn) {
        if let Some(address) = self.ftl.lookup(lpn) {
            self.queue.schedule(Operation::read(address, lpn));
        }
    }

    pub fn schedule_gc(&mut self, scope: GcScope) -> Result<GcOutcome> {
        let mut io = Io {
            scheduler: &mut self.queue,
            ftl: &mut self.ftl,
        };
        self.controller.schedule_gc(scope, &mut io)
    }

    /// Delivers the next completion. Returns `false` once nothing is left to
    /// do.
    pub fn step(&mut self) -> Result<bool> {
        let Some(op) = self.queue.pop() else {
            if self.stalled.is_empty() {
                return Ok(false);
            }
            return self.unstall().map(|_| true);
        };

        let mut io = Io {
            scheduler: &mut self.queue,
            ftl: &mut self.ftl,
        };
        match op.kind {
            OpKind::Read | OpKind::CopyBackRead => self.controller.register_read_outcome(&op, &mut io)?,
            OpKind::Write | OpKind::CopyBack => {
                if !op.is_gc() {
                    self.app_in_flight -= 1;
                }
                self.controller.register_write_outcome(&op, &mut io)?
            }
            OpKind::Erase => self.controller.register_erase_outcome(&op, &mut io)?,
        }
        self.dispatch_stalled()?;
        Ok(true)
    }

    /// Runs until every submitted write has completed and the device is idle.
    pub fn drain(&mut self) -> Result<()> {
        while self.step()? {}
        Ok(())
    }

    fn dispatch_stalled(&mut self) -> Result<()> {
        while let Some(&lpn) = self.stalled.front() {
            let mut io = Io {
                scheduler: &mut self.queue,
                ftl: &mut self.ftl,
            };
            let address = self.controller.allocate_for_write(lpn, &mut io)?;
            if address.is_none() {
                break;
            }
            self.stalled.pop_front();
            self.app_in_flight += 1;
            self.queue.schedule(Operation::write(address, lpn));
        }
        Ok(())
    }

    /// Nothing is in flight but writes are waiting: the only way forward is
    /// a reclamation started right now.
    fn unstall(&mut self) -> Result<()> {
        warn!("{} writes stalled on an idle device", self.stalled.len());
        let outcome = self.schedule_gc(GcScope::ANY)?;
        debug!("unstall gc: {:?}", outcome);
        self.dispatch_stalled()?;
        if self.queue.is_empty() {
            return Err(Error::OutOfSpace {
                stalled: self.stalled.len(),
            });
        }
        Ok(())
    }

    /// Where `lpn` currently lives, if anywhere.
    pub fn locate(&self, lpn: Lpn) -> Option<Address> {
        self.ftl.lookup(lpn)
    }
}
