#[cfg(test)]
use std::println as warn;

#[cfg(not(test))]
use log::warn;

use crate::block_manager::BlockManager;
use crate::config::*;
use crate::device::Ssd;
use crate::event::{Event, EventKind, IoScheduler};
use crate::ftl::FastFtl;
use std::collections::VecDeque;

/// Time-ordered queue of event chains. Each chain preserves intra-chain
/// order: a successor only becomes runnable at its predecessor's completion.
/// Ties in start time resolve by submission order.
#[derive(Default)]
pub struct EventQueue {
    chains: Vec<VecDeque<Event>>,
}

impl IoScheduler for EventQueue {
    fn schedule_independent_event(&mut self, event: Event) {
        self.chains.push(VecDeque::from(vec![event]));
    }

    fn schedule_dependent_events(&mut self, chain: Vec<Event>) {
        if !chain.is_empty() {
            self.chains.push(VecDeque::from(chain));
        }
    }
}

impl EventQueue {
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Removes and returns the runnable event with the earliest start time,
    /// along with the rest of its chain.
    fn pop_earliest(&mut self) -> Option<(Event, VecDeque<Event>)> {
        let mut best: Option<usize> = None;
        for (i, chain) in self.chains.iter().enumerate() {
            match best {
                None => best = Some(i),
                Some(j) if chain[0].start_time < self.chains[j][0].start_time => best = Some(i),
                _ => {}
            }
        }
        let idx = best?;
        let mut chain = self.chains.remove(idx);
        let head = chain.pop_front().expect("empty chain in queue");
        Some((head, chain))
    }
}

/// Wires the device, the block manager and the FTL to one event queue and
/// drives them to completion.
pub struct Simulation {
    pub ssd: Ssd,
    pub bm: BlockManager,
    pub ftl: FastFtl,
    cfg: Config,
    queue: EventQueue,
    now: Time,
    completed: usize,
    erases_done: usize,
    failed_reads: usize,
    failed_writes: usize,
    stall_streak: usize,
}

impl Simulation {
    pub fn new(cfg: Config) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Simulation {
            ssd: Ssd::new(&cfg),
            bm: BlockManager::new(&cfg),
            ftl: FastFtl::new(&cfg),
            cfg,
            queue: EventQueue::default(),
            now: 0.0,
            completed: 0,
            erases_done: 0,
            failed_reads: 0,
            failed_writes: 0,
            stall_streak: 0,
        })
    }

    pub fn submit_write(&mut self, lba: Addr, start_time: Time) {
        self.queue
            .schedule_independent_event(Event::new(EventKind::Write, Some(lba), start_time));
    }

    pub fn submit_read(&mut self, lba: Addr, start_time: Time) {
        self.queue
            .schedule_independent_event(Event::new(EventKind::Read, Some(lba), start_time));
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn erases(&self) -> usize {
        self.erases_done
    }

    pub fn failed_reads(&self) -> usize {
        self.failed_reads
    }

    pub fn failed_writes(&self) -> usize {
        self.failed_writes
    }

    pub fn now(&self) -> Time {
        self.now
    }

    pub fn run(&mut self) {
        while self.step() {}
    }

    /// Executes one event: FTL address resolution where needed, the arrival
    /// hook, the device issue, then the outcome hook. Returns false when the
    /// queue is drained.
    pub fn step(&mut self) -> bool {
        let Some((mut event, mut rest)) = self.queue.pop_earliest() else {
            return false;
        };
        if event.start_time < self.now {
            event.start_time = self.now;
        }
        self.now = event.start_time;

        match event.kind {
            EventKind::Write => {
                if !self.bm.can_write(&event) {
                    self.stall_streak += 1;
                    if self.stall_streak > 4 * (self.queue.len() + 1) {
                        warn!(
                            "dropping write of lba {:?}: no reservable pages",
                            event.logical_address
                        );
                        self.failed_writes += 1;
                        return true;
                    }
                    // Let reclamation make room and come back to this write.
                    self.bm
                        .check_if_should_trigger_more_gc(&mut self.ssd, &mut self.queue, self.now);
                    event.start_time = self.now + self.cfg.block_erase_delay;
                    rest.push_front(event);
                    self.queue.chains.push(rest);
                    return true;
                }
                self.stall_streak = 0;
                if event.physical_address.is_none() {
                    if let Err(e) =
                        self.ftl
                            .write(&mut event, &mut self.bm, &mut self.ssd, &mut self.queue)
                    {
                        warn!("write of lba {:?} failed: {}", event.logical_address, e);
                        self.failed_writes += 1;
                        return true;
                    }
                }
                self.bm.register_write_arrival(&event, &mut self.ssd);
                self.ssd.issue(&mut event);
                self.bm
                    .register_write_outcome(&event, &mut self.ssd, &mut self.queue);
            }
            EventKind::Read | EventKind::ReadCommand => {
                self.stall_streak = 0;
                if event.physical_address.is_none() {
                    if self.ftl.read(&mut event, &self.bm).is_err() {
                        self.failed_reads += 1;
                        return true;
                    }
                }
                // The hooks observe the NAND command phase.
                event.kind = EventKind::ReadCommand;
                self.ssd.issue(&mut event);
                self.bm.register_read_outcome(&event);
            }
            EventKind::Erase => {
                self.stall_streak = 0;
                self.ssd.issue(&mut event);
                self.bm
                    .register_erase_outcome(&event, &mut self.ssd, &mut self.queue);
                self.erases_done += 1;
            }
        }

        if let Some(next) = rest.front_mut() {
            if next.start_time < event.completion_time() {
                next.start_time = event.completion_time();
            }
        }
        if !rest.is_empty() {
            self.queue.chains.push(rest);
        }
        self.completed += 1;
        true
    }
}
