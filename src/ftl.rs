#[cfg(test)]
use std::{println as debug, println as warn};

#[cfg(not(test))]
use log::{debug, warn};

use crate::address::{Address, ValidLevel};
use crate::block_manager::BlockManager;
use crate::config::*;
use crate::device::Ssd;
use crate::event::{Event, EventKind, IoScheduler};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FtlError {
    #[error("read of never-written logical address {lba}")]
    UnmappedRead { lba: Addr },
    #[error("no free block available")]
    OutOfBlocks,
    #[error("no reservable pages for a merge of {0} copies")]
    OutOfCapacity(Counter),
}

/// A physical block used as an append buffer, with the per-page-index map
/// into it: `pages[i]` is the offset inside the block where logical page `i`
/// currently lives, if it does.
#[derive(Debug)]
struct LogPageBlock {
    address: Address,
    pages: Vec<Option<PageId>>,
    next_offset: PageId,
}

impl LogPageBlock {
    fn new(address: Address, block_size: BaseType) -> Self {
        LogPageBlock {
            address,
            pages: vec![None; block_size],
            next_offset: 0,
        }
    }

    fn lookup(&self, page: PageId) -> Option<PageId> {
        self.pages[page]
    }

    /// Records logical page `page` at the append cursor and returns the
    /// offset it landed on. A newer copy simply supersedes the old entry.
    fn append(&mut self, page: PageId) -> PageId {
        debug_assert!(self.next_offset < self.pages.len(), "append into a full log block");
        let offset = self.next_offset;
        self.pages[page] = Some(offset);
        self.next_offset += 1;
        offset
    }

    fn is_full(&self) -> bool {
        self.next_offset == self.pages.len()
    }

    /// True when the block is a complete in-order image of its logical
    /// block, which is what makes a switch legal.
    fn holds_full_sequential_image(&self) -> bool {
        self.pages.iter().enumerate().all(|(i, p)| *p == Some(i))
    }
}

/// Log-buffer FTL with fully-associative sector translation: a block-level
/// data mapping, a single sequential write stream and a bounded set of
/// random log blocks.
pub struct FastFtl {
    cfg: Config,
    address_shift: u32,
    /// Logical block -> linear address of its data block.
    data_list: Vec<Option<Addr>>,
    /// Random log blocks, keyed by logical block, bounded by `page_max_log`.
    log_map: HashMap<BaseType, LogPageBlock>,
    /// Insertion order of `log_map` keys; the front is the eviction victim.
    log_order: VecDeque<BaseType>,
    sequential_log: Option<LogPageBlock>,
    sequential_logical_address: Option<BaseType>,
    /// Next logical offset the stream accepts as an append.
    sequential_offset: PageId,
}

enum Placement {
    StartStream,
    AppendSequential,
    RandomLog,
}

impl FastFtl {
    pub fn new(cfg: &Config) -> Self {
        FastFtl {
            cfg: cfg.clone(),
            address_shift: cfg.block_size.trailing_zeros(),
            data_list: vec![None; cfg.total_blocks()],
            log_map: HashMap::new(),
            log_order: VecDeque::new(),
            sequential_log: None,
            sequential_logical_address: None,
            sequential_offset: 0,
        }
    }

    fn split(&self, lba: Addr) -> (BaseType, PageId) {
        let lb = lba >> self.address_shift;
        debug_assert!(lb < self.data_list.len(), "logical address {} out of range", lba);
        (lb, lba % self.cfg.block_size)
    }

    fn lba_at(&self, lb: BaseType, page: PageId) -> Addr {
        (lb << self.address_shift) + page
    }

    fn page_of_block(cfg: &Config, block: &Address, offset: PageId) -> Address {
        Address::from_linear(cfg, block.linear(cfg) + offset, ValidLevel::Page)
    }

    /// Where `lba` currently lives: sequential log, then random log, then
    /// the data block. Log hits are checked against the block manager's
    /// reverse index so a superseded or reclaimed copy is never returned.
    fn current_location(&self, bm: &BlockManager, lba: Addr) -> Option<Address> {
        let (lb, off) = self.split(lba);
        if self.sequential_logical_address == Some(lb) {
            if let Some(log) = &self.sequential_log {
                if let Some(o) = log.lookup(off) {
                    let linear = log.address.linear(&self.cfg) + o;
                    if bm.logical_address_of(linear) == Some(lba) {
                        return Some(Address::from_linear(&self.cfg, linear, ValidLevel::Page));
                    }
                }
            }
        }
        if let Some(log) = self.log_map.get(&lb) {
            if let Some(o) = log.lookup(off) {
                let linear = log.address.linear(&self.cfg) + o;
                if bm.logical_address_of(linear) == Some(lba) {
                    return Some(Address::from_linear(&self.cfg, linear, ValidLevel::Page));
                }
            }
        }
        if let Some(base) = self.data_list[lb] {
            // A mismatching occupant means the block was reclaimed under us;
            // an unset entry can still be a copy in flight.
            match bm.logical_address_of(base + off) {
                Some(other) if other != lba => {}
                _ => return Some(Address::from_linear(&self.cfg, base + off, ValidLevel::Page)),
            }
        }
        None
    }

    /// Resolves the event's physical address. A miss in both the log blocks
    /// and the data mapping is a failed read.
    pub fn read(&self, event: &mut Event, bm: &BlockManager) -> Result<(), FtlError> {
        debug_assert!(matches!(event.kind, EventKind::Read | EventKind::ReadCommand));
        let lba = event.logical_address.expect("read without logical address");
        match self.current_location(bm, lba) {
            Some(a) => {
                event.physical_address = a;
                Ok(())
            }
            None => {
                event.physical_address = Address::none();
                warn!("read of never-written logical address {}", lba);
                Err(FtlError::UnmappedRead { lba })
            }
        }
    }

    /// Classifies the write, performs whatever switch or merge the stream
    /// state calls for, places the page and fills in the replace address of
    /// the copy it supersedes.
    pub fn write(
        &mut self,
        event: &mut Event,
        bm: &mut BlockManager,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
    ) -> Result<(), FtlError> {
        debug_assert!(event.kind == EventKind::Write);
        let lba = event.logical_address.expect("write without logical address");
        let (lb, off) = self.split(lba);
        let time = event.start_time;

        let placement = if off == 0 {
            let switchable = self.sequential_logical_address.is_some()
                && self.sequential_log.as_ref().map_or(false, |log| {
                    log.holds_full_sequential_image()
                        && !bm.is_migrating(log.address.block_id(&self.cfg))
                });
            if switchable {
                self.switch_sequential(bm, ssd, sched, time);
            } else {
                self.merge_sequential(bm, ssd, sched, time)?;
            }
            Placement::StartStream
        } else if self.sequential_logical_address == Some(lb) {
            let appendable = off == self.sequential_offset
                && self.sequential_log.as_ref().map_or(false, |log| {
                    !bm.is_migrating(log.address.block_id(&self.cfg))
                });
            if appendable {
                Placement::AppendSequential
            } else {
                self.merge_sequential(bm, ssd, sched, time)?;
                Placement::StartStream
            }
        } else {
            self.prepare_random_log(lb, bm, ssd, sched, time)?;
            Placement::RandomLog
        };

        let replaced = self.current_location(bm, lba);
        let placed = match placement {
            Placement::StartStream => {
                self.begin_sequential_stream(lb, off, bm, ssd, sched, time)?
            }
            Placement::AppendSequential => {
                let log = self.sequential_log.as_mut().expect("stream without a log block");
                let offset = log.append(off);
                self.sequential_offset += 1;
                Self::page_of_block(&self.cfg, &log.address, offset)
            }
            Placement::RandomLog => {
                let log = self.log_map.get_mut(&lb).expect("random log block just prepared");
                let offset = log.append(off);
                Self::page_of_block(&self.cfg, &log.address, offset)
            }
        };
        event.physical_address = placed;
        event.replace_address = replaced.unwrap_or_else(Address::none);
        Ok(())
    }

    fn begin_sequential_stream(
        &mut self,
        lb: BaseType,
        off: PageId,
        bm: &mut BlockManager,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        time: Time,
    ) -> Result<Address, FtlError> {
        let block = bm.find_free_unused_block(ssd, sched, time);
        if block.is_none() {
            return Err(FtlError::OutOfBlocks);
        }
        let mut log = LogPageBlock::new(block.to_block_level(), self.cfg.block_size);
        let offset = log.append(off);
        let placed = Self::page_of_block(&self.cfg, &log.address, offset);
        debug!("sequential stream starts for logical block {} in block at {}", lb, log.address);
        self.sequential_log = Some(log);
        self.sequential_logical_address = Some(lb);
        self.sequential_offset = off + 1;
        Ok(placed)
    }

    /// Promotes the full sequential log block to data block of the stream
    /// owner. No copy I/O is incurred.
    fn switch_sequential(
        &mut self,
        bm: &mut BlockManager,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        time: Time,
    ) {
        let owner = self.sequential_logical_address.take().expect("switch without a stream");
        let log = self.sequential_log.take().expect("switch without a log block");
        self.sequential_offset = 0;
        if let Some(base) = self.data_list[owner] {
            self.retire_data_block_if_current(owner, base, bm, ssd, sched, time);
        }
        self.data_list[owner] = Some(log.address.linear(&self.cfg));
        debug!(
            "switch: block at {} promoted to data block of logical block {}",
            log.address, owner
        );
    }

    /// Merges the sequential stream into a fresh data block and closes it.
    /// A no-op when no stream is open.
    fn merge_sequential(
        &mut self,
        bm: &mut BlockManager,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        time: Time,
    ) -> Result<(), FtlError> {
        let Some(owner) = self.sequential_logical_address else {
            return Ok(());
        };
        let log = self.sequential_log.take();
        match self.merge(owner, log.as_ref(), bm, ssd, sched, time) {
            Ok(()) => {
                self.sequential_logical_address = None;
                self.sequential_offset = 0;
                Ok(())
            }
            Err(e) => {
                self.sequential_log = log;
                Err(e)
            }
        }
    }

    /// Rebuilds `lb` into a fresh data block: for every page index the log
    /// copy wins over the data copy, and each survivor moves through a
    /// dependent read-then-write chain. Both source blocks are then retired and
    /// the mapping repointed.
    fn merge(
        &mut self,
        lb: BaseType,
        log: Option<&LogPageBlock>,
        bm: &mut BlockManager,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        time: Time,
    ) -> Result<(), FtlError> {
        let old_data = self.data_list[lb];
        let mut sources = Vec::new();
        for i in 0..self.cfg.block_size {
            let lba = self.lba_at(lb, i);
            let log_src = log
                .and_then(|l| l.lookup(i).map(|o| l.address.linear(&self.cfg) + o))
                .filter(|&linear| bm.logical_address_of(linear) == Some(lba));
            let src = log_src.or_else(|| {
                old_data
                    .map(|base| base + i)
                    .filter(|&linear| bm.logical_address_of(linear) == Some(lba))
            });
            if let Some(src) = src {
                sources.push((i, lba, src));
            }
        }
        if !bm.reserve_copy_capacity(sources.len()) {
            return Err(FtlError::OutOfCapacity(sources.len()));
        }
        let new_block = bm.find_free_unused_block(ssd, sched, time);
        if new_block.is_none() {
            bm.release_copy_capacity(sources.len());
            return Err(FtlError::OutOfBlocks);
        }
        let new_base = new_block.linear(&self.cfg);
        for &(i, lba, src) in &sources {
            let mut read = Event::new(EventKind::Read, Some(lba), time);
            read.physical_address = Address::from_linear(&self.cfg, src, ValidLevel::Page);
            read.is_garbage_collection_op = true;
            let mut write = Event::new(EventKind::Write, Some(lba), time);
            write.physical_address = Address::from_linear(&self.cfg, new_base + i, ValidLevel::Page);
            write.is_garbage_collection_op = true;
            sched.schedule_dependent_events(vec![read, write]);
        }
        if let Some(l) = log {
            bm.retire_block(ssd, sched, &l.address, time);
        }
        if let Some(base) = old_data {
            self.retire_data_block_if_current(lb, base, bm, ssd, sched, time);
        }
        self.data_list[lb] = Some(new_base);
        debug!(
            "merge: logical block {} rebuilt into block at {} ({} copies)",
            lb,
            new_block,
            sources.len()
        );
        Ok(())
    }

    /// Ensures `lb` has a random log block with room to append. A dead
    /// mapping (every copy superseded elsewhere, block already reclaimed) is
    /// dropped; a full or migrating log block is merged out first; the bound
    /// on concurrent log blocks evicts the eldest mapping.
    fn prepare_random_log(
        &mut self,
        lb: BaseType,
        bm: &mut BlockManager,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        time: Time,
    ) -> Result<(), FtlError> {
        enum Entry {
            Missing,
            Usable,
            Dead,
            MustMerge,
        }
        let entry = match self.log_map.get(&lb) {
            None => Entry::Missing,
            Some(log) if self.log_block_is_dead(lb, log, bm) => Entry::Dead,
            Some(log) if log.is_full() || bm.is_migrating(log.address.block_id(&self.cfg)) => {
                Entry::MustMerge
            }
            Some(_) => Entry::Usable,
        };
        match entry {
            Entry::Usable => return Ok(()),
            Entry::Missing => {}
            Entry::Dead => {
                debug!("dropping dead log mapping of logical block {}", lb);
                self.log_map.remove(&lb);
                self.log_order.retain(|&k| k != lb);
            }
            Entry::MustMerge => {
                let log = self.log_map.remove(&lb).expect("entry observed above");
                self.log_order.retain(|&k| k != lb);
                debug!("log block of logical block {} must merge before more appends", lb);
                if let Err(e) = self.merge(lb, Some(&log), bm, ssd, sched, time) {
                    self.log_order.push_back(lb);
                    self.log_map.insert(lb, log);
                    return Err(e);
                }
            }
        }

        if self.log_map.len() >= self.cfg.page_max_log {
            let victim = self.log_order.pop_front().expect("log bound hit with empty order");
            let log = self.log_map.remove(&victim).expect("ordered key missing from log map");
            if self.log_block_is_dead(victim, &log, bm) {
                debug!("evicted log mapping of logical block {} was already dead", victim);
            } else {
                debug!("evicting log block of logical block {} (block at {})", victim, log.address);
                if let Err(e) = self.merge(victim, Some(&log), bm, ssd, sched, time) {
                    self.log_order.push_front(victim);
                    self.log_map.insert(victim, log);
                    return Err(e);
                }
            }
        }
        let block = bm.find_free_unused_block(ssd, sched, time);
        if block.is_none() {
            return Err(FtlError::OutOfBlocks);
        }
        self.log_map
            .insert(lb, LogPageBlock::new(block.to_block_level(), self.cfg.block_size));
        self.log_order.push_back(lb);
        Ok(())
    }

    /// A log mapping is dead when none of its entries still resolve to this
    /// logical block: every copy was superseded and the block manager has
    /// already reclaimed (and possibly rehomed) the block.
    fn log_block_is_dead(&self, lb: BaseType, log: &LogPageBlock, bm: &BlockManager) -> bool {
        let base = log.address.linear(&self.cfg);
        !(0..self.cfg.block_size).any(|i| {
            log.lookup(i)
                .map_or(false, |o| bm.logical_address_of(base + o) == Some(self.lba_at(lb, i)))
        })
    }

    /// Retires the old data block only while it still holds this logical
    /// block's pages; a stale mapping onto a reclaimed (or rehomed) block
    /// must not touch it.
    fn retire_data_block_if_current(
        &self,
        lb: BaseType,
        base: Addr,
        bm: &mut BlockManager,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        time: Time,
    ) {
        let still_ours = (0..self.cfg.block_size)
            .any(|i| bm.logical_address_of(base + i) == Some(self.lba_at(lb, i)));
        if still_ours {
            let a = Address::from_linear(&self.cfg, base, ValidLevel::Block);
            bm.retire_block(ssd, sched, &a, time);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::PageState;
    use crate::sim::Simulation;

    fn cfg(plane_size: BaseType) -> Config {
        Config {
            ssd_size: 1,
            package_size: 1,
            die_size: 1,
            plane_size,
            block_size: 4,
            block_erases: 10,
            num_age_classes: 2,
            page_max_log: 2,
            greedy_gc: false,
            ..Config::default()
        }
    }

    fn write_all(sim: &mut Simulation, lbas: &[Addr], t: &mut Time) {
        for &lba in lbas {
            sim.submit_write(lba, *t);
            *t += 1000.0;
        }
        sim.run();
    }

    fn located(sim: &Simulation, lba: Addr) -> Address {
        let mut e = Event::new(EventKind::Read, Some(lba), 0.0);
        sim.ftl.read(&mut e, &sim.bm).expect("mapped lba must resolve");
        e.physical_address
    }

    #[test]
    fn switch_promotes_a_full_sequential_log_without_copies() {
        let c = cfg(4);
        let mut sim = Simulation::new(c.clone()).unwrap();
        let mut t = 0.0;
        write_all(&mut sim, &[0, 1, 2, 3], &mut t);
        assert!(sim.ftl.data_list[0].is_none());

        // The next block start finds the log completely and sequentially
        // written: promotion, no copy traffic, no erase.
        write_all(&mut sim, &[4], &mut t);
        let base = sim.ftl.data_list[0].expect("switch must promote the log block");
        for i in 0..4 {
            let a = Address::from_linear(&c, base + i, ValidLevel::Page);
            assert_eq!(sim.ssd.block(&a).page_state(i), PageState::Valid);
        }
        assert_eq!(sim.ftl.sequential_logical_address, Some(1));
        assert_eq!(sim.ftl.sequential_offset, 1);
        assert_eq!(sim.erases(), 0);
        let programmed: BaseType = (0..c.total_blocks())
            .map(|b| {
                let blk = sim.ssd.block_by_id(b);
                blk.pages_valid() + blk.pages_invalid()
            })
            .sum();
        assert_eq!(programmed, 5, "a switch must not copy pages");
        sim.bm.audit(&sim.ssd);
    }

    #[test]
    fn non_monotonic_offset_merges_and_restarts_the_stream() {
        let c = cfg(4);
        let mut sim = Simulation::new(c.clone()).unwrap();
        let mut t = 0.0;
        write_all(&mut sim, &[0], &mut t);
        write_all(&mut sim, &[2], &mut t);

        let base = sim.ftl.data_list[0].expect("merge must produce a data block");
        assert_eq!(located(&sim, 0).linear(&c), base, "merged copy of lba 0");

        assert_eq!(sim.ftl.sequential_logical_address, Some(0));
        assert_eq!(sim.ftl.sequential_offset, 3);
        let seq = sim.ftl.sequential_log.as_ref().unwrap();
        assert_eq!(seq.lookup(2), Some(0), "restart appends at log offset 0");
        assert_eq!(
            located(&sim, 2).linear(&c),
            seq.address.linear(&c),
            "newest copy of lba 2 lives in the fresh log"
        );
        assert_eq!(sim.erases(), 1, "the first stream's log block is reclaimed");
        sim.bm.audit(&sim.ssd);
    }

    #[test]
    fn log_map_eviction_random_merges_the_eldest_entry() {
        let c = cfg(8);
        let mut sim = Simulation::new(c.clone()).unwrap();
        let mut t = 0.0;
        // Build a full data block for logical block 0 via a switch.
        write_all(&mut sim, &[0, 1, 2, 3], &mut t);
        write_all(&mut sim, &[4], &mut t);
        let old_data = sim.ftl.data_list[0].unwrap();

        // Random writes: lb 0 (rewrite of page 2), then lb 2, filling the
        // log bound of two.
        write_all(&mut sim, &[2], &mut t);
        assert!(sim.ftl.log_map.contains_key(&0));
        write_all(&mut sim, &[9], &mut t);
        assert_eq!(sim.ftl.log_map.len(), 2);

        // The third distinct block evicts the eldest entry (lb 0): a random
        // merge of its log block and data block, one chain per page.
        let erases_before = sim.erases();
        write_all(&mut sim, &[13], &mut t);
        let new_data = sim.ftl.data_list[0].unwrap();
        assert_ne!(new_data, old_data);
        assert!(!sim.ftl.log_map.contains_key(&0));
        assert!(sim.ftl.log_map.contains_key(&2));
        assert!(sim.ftl.log_map.contains_key(&3));
        for i in 0..4 {
            assert_eq!(located(&sim, i).linear(&c), new_data + i);
        }
        assert_eq!(sim.erases() - erases_before, 2, "log and data block both reclaimed");
        sim.bm.audit(&sim.ssd);
    }

    #[test]
    fn full_random_log_merges_before_further_appends() {
        let c = cfg(8);
        let mut sim = Simulation::new(c.clone()).unwrap();
        let mut t = 0.0;
        // Four appends fill the log block for lb 0 (the rewrite of lba 1
        // supersedes its own earlier copy).
        write_all(&mut sim, &[1, 2, 3, 1], &mut t);
        assert!(sim.ftl.log_map[&0].is_full());

        write_all(&mut sim, &[2], &mut t);
        let base = sim.ftl.data_list[0].expect("full log must merge into a data block");
        assert_eq!(located(&sim, 1).linear(&c), base + 1);
        assert_eq!(located(&sim, 3).linear(&c), base + 3);
        let log = &sim.ftl.log_map[&0];
        assert_eq!(log.lookup(2), Some(0), "newest copy went to the fresh log block");
        assert_eq!(located(&sim, 2).linear(&c), log.address.linear(&c));
        assert!(sim.erases() >= 1);
        sim.bm.audit(&sim.ssd);
    }

    #[test]
    fn reads_return_the_last_written_location() {
        let c = cfg(16);
        let mut sim = Simulation::new(c.clone()).unwrap();
        let mut t = 0.0;
        let workload: [Addr; 16] = [0, 1, 2, 3, 4, 5, 9, 10, 13, 2, 21, 22, 23, 1, 17, 2];
        write_all(&mut sim, &workload, &mut t);

        let mut written: Vec<Addr> = workload.to_vec();
        written.sort_unstable();
        written.dedup();
        for lba in written {
            let a = located(&sim, lba);
            assert_eq!(
                sim.bm.logical_address_of(a.linear(&c)),
                Some(lba),
                "lba {} must resolve to a page that holds it",
                lba
            );
            assert_eq!(sim.ssd.block(&a).page_state(a.page), PageState::Valid);
        }
        sim.bm.audit(&sim.ssd);
    }

    #[test]
    fn read_of_unwritten_lba_fails_with_a_sentinel() {
        let c = cfg(4);
        let sim = Simulation::new(c).unwrap();
        let mut e = Event::new(EventKind::Read, Some(7), 0.0);
        let err = sim.ftl.read(&mut e, &sim.bm).unwrap_err();
        assert_eq!(err, FtlError::UnmappedRead { lba: 7 });
        assert!(e.physical_address.is_none());
    }
}
