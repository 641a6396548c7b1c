#[cfg(test)]
use std::{println as trace, println as debug};

#[cfg(not(test))]
use log::{debug, trace};

use crate::address::{block_address, block_base, Address, ValidLevel};
use crate::config::*;
use crate::device::{BlockState, PageState, Ssd};
use crate::event::{Event, EventKind, IoScheduler};
use std::collections::{BTreeSet, VecDeque};

/// Physical-block lifecycle: free-space accounting, landing addresses for
/// writes, garbage collection, wear leveling and age classification.
///
/// Owns no device state. Blocks are referenced by ordinal ([`BlockId`]) into
/// the [`Ssd`] arena, which is passed into every operation that touches it.
pub struct BlockManager {
    cfg: Config,

    /// Per-die active write pointer; `page` is the next free offset.
    free_block_pointers: Vec<Vec<Address>>,
    /// `[package][die][age_class]` stacks of free blocks.
    free_blocks: Vec<Vec<Vec<Vec<Address>>>>,

    max_age: Counter,
    min_age: Counter,
    blocks_with_min_age: BTreeSet<BlockId>,
    /// Blocks queued for wear-leveling migration. Survives across calls so
    /// the "a pass is already active" check actually means something.
    wl_queue: VecDeque<BlockId>,

    /// Pages in erased state anywhere on the device.
    num_free_pages: Counter,
    /// Pages reservable by non-GC writes. The difference to `num_free_pages`
    /// is what in-flight migrations have already promised away.
    num_available_pages_for_new_writes: Counter,

    /// `[package][die][age_class]` sets of blocks eligible for reclamation.
    gc_candidates: Vec<Vec<Vec<BTreeSet<BlockId>>>>,
    /// Victims whose pages are still relocating. Kept out of the candidate
    /// index until their erase completes, so one block is never migrated
    /// twice concurrently.
    migrating: BTreeSet<BlockId>,
    /// Blocks with an erase event in flight. Several paths can observe the
    /// same block going fully invalid; only the first one issues the erase.
    pending_erase: BTreeSet<BlockId>,

    /// Reverse index: which logical address a programmed page holds. Fed by
    /// the outcome hooks, which observe every placement and invalidation.
    lba_of: Vec<Option<Addr>>,
}

impl BlockManager {
    pub fn new(cfg: &Config) -> Self {
        let mut free_blocks =
            vec![vec![vec![Vec::new(); cfg.num_age_classes]; cfg.package_size]; cfg.ssd_size];
        let mut blocks_with_min_age = BTreeSet::new();
        for package in 0..cfg.ssd_size {
            for die in 0..cfg.package_size {
                for plane in 0..cfg.die_size {
                    for block in 0..cfg.plane_size {
                        let a = Address::new(package, die, plane, block, 0, ValidLevel::Page);
                        blocks_with_min_age.insert(a.block_id(cfg));
                        free_blocks[package][die][0].push(a);
                    }
                }
            }
        }
        let mut free_block_pointers =
            vec![vec![Address::none(); cfg.package_size]; cfg.ssd_size];
        for package in 0..cfg.ssd_size {
            for die in 0..cfg.package_size {
                free_block_pointers[package][die] = free_blocks[package][die][0]
                    .pop()
                    .expect("die without a single block");
            }
        }
        BlockManager {
            cfg: cfg.clone(),
            free_block_pointers,
            free_blocks,
            max_age: 1,
            min_age: 0,
            blocks_with_min_age,
            wl_queue: VecDeque::new(),
            num_free_pages: cfg.total_pages(),
            num_available_pages_for_new_writes: cfg.total_pages(),
            gc_candidates: vec![
                vec![vec![BTreeSet::new(); cfg.num_age_classes]; cfg.package_size];
                cfg.ssd_size
            ],
            migrating: BTreeSet::new(),
            pending_erase: BTreeSet::new(),
            lba_of: vec![None; cfg.total_pages()],
        }
    }

    pub fn num_free_pages(&self) -> Counter {
        self.num_free_pages
    }

    pub fn num_available_pages_for_new_writes(&self) -> Counter {
        self.num_available_pages_for_new_writes
    }

    /// Whether `bid` is a migration victim with relocations still in flight.
    pub fn is_migrating(&self, bid: BlockId) -> bool {
        self.migrating.contains(&bid)
    }

    /// Which logical address the programmed page at `linear` currently holds.
    pub fn logical_address_of(&self, linear: Addr) -> Option<Addr> {
        self.lba_of[linear]
    }

    /// Reserves destination capacity for copy chains issued outside
    /// [`BlockManager::migrate`], e.g. log merges. Refused rather than
    /// asserted: the caller backs off instead of over-promising.
    pub fn reserve_copy_capacity(&mut self, pages: Counter) -> bool {
        if self.num_available_pages_for_new_writes < pages {
            return false;
        }
        self.num_available_pages_for_new_writes -= pages;
        true
    }

    pub fn release_copy_capacity(&mut self, pages: Counter) {
        self.num_available_pages_for_new_writes += pages;
        debug_assert!(self.num_available_pages_for_new_writes <= self.num_free_pages);
    }

    pub fn can_write(&self, event: &Event) -> bool {
        self.num_available_pages_for_new_writes > 0 || event.is_garbage_collection_op
    }

    /// Wear bin for the block behind `a`, in `[0, num_age_classes)`. Raises
    /// `max_age` first when the block is older than anything seen so far.
    pub fn sort_into_age_class(&mut self, ssd: &Ssd, a: &Address) -> BaseType {
        let age = self.cfg.block_erases - ssd.block(a).erases_remaining();
        if age > self.max_age {
            self.max_age = age;
        }
        if self.max_age == self.min_age {
            return 0;
        }
        let normalized =
            age.saturating_sub(self.min_age) as f64 / (self.max_age - self.min_age) as f64;
        (normalized * self.cfg.num_age_classes as f64 * 0.99999) as BaseType
    }

    // -- write-path hooks ---------------------------------------------------

    /// Invalidates the original location of a write, before the write itself
    /// completes.
    pub fn register_write_arrival(&mut self, event: &Event, ssd: &mut Ssd) {
        assert!(event.kind == EventKind::Write, "arrival hook expects a write");
        let ra = event.replace_address;
        if ra.valid == ValidLevel::None {
            return;
        }
        if ssd.block(&ra).page_state(ra.page) == PageState::Valid {
            ssd.block_mut(&ra).invalidate_page(ra.page);
            self.lba_of[ra.linear(&self.cfg)] = None;
        }
    }

    pub fn register_write_outcome(
        &mut self,
        event: &Event,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
    ) {
        debug_assert!(event.kind == EventKind::Write);
        assert!(self.num_free_pages > 0, "free-page counter underflow");
        self.num_free_pages -= 1;
        if !event.is_garbage_collection_op {
            assert!(
                self.num_available_pages_for_new_writes > 0,
                "available-page counter underflow"
            );
            self.num_available_pages_for_new_writes -= 1;
        }

        let phys = event.physical_address;
        debug_assert!(phys.valid == ValidLevel::Page, "write outcome without a page target");
        if let Some(lba) = event.logical_address {
            self.lba_of[phys.linear(&self.cfg)] = Some(lba);
        }

        if self.num_free_pages <= self.cfg.block_size {
            debug!("only {} free pages left, emergency GC pass", self.num_free_pages);
            self.perform_gc(ssd, sched, event.completion_time());
        }

        self.advance_write_pointer(ssd, sched, &phys, event.completion_time());

        let ra = event.replace_address;
        if ra.valid == ValidLevel::None {
            return;
        }
        let bid = ra.block_id(&self.cfg);
        let klass = self.sort_into_age_class(ssd, &ra);
        let block = ssd.block_by_id(bid);
        let (state, invalid) = (block.state(), block.pages_invalid());
        // TODO: revisit the quarter-block threshold once real traces exist.
        if state == BlockState::Active
            && !self.is_write_pointer(bid)
            && (invalid >= self.cfg.block_size / 4
                || self.gc_candidates[ra.package][ra.die][klass].is_empty())
        {
            self.insert_candidate(ra.package, ra.die, klass, bid);
        }
        if invalid == self.cfg.block_size && !self.is_write_pointer(bid) {
            self.remove_candidate(ra.package, ra.die, bid);
            self.schedule_erase(sched, bid, event.completion_time());
        }
    }

    pub fn register_erase_outcome(
        &mut self,
        event: &Event,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
    ) {
        debug_assert!(event.kind == EventKind::Erase);
        let mut a = event.physical_address;
        a.valid = ValidLevel::Page;
        a.page = 0;
        self.num_free_pages += self.cfg.block_size;
        self.num_available_pages_for_new_writes += self.cfg.block_size;
        self.migrating.remove(&a.block_id(&self.cfg));
        self.pending_erase.remove(&a.block_id(&self.cfg));
        // Wear leveling must see `max_age` before the classification below
        // raises it, or its spread check can never fire.
        self.wear_level(event, ssd, sched);
        let klass = self.sort_into_age_class(ssd, &a);
        self.free_blocks[a.package][a.die][klass].push(a);
    }

    pub fn register_read_outcome(&self, event: &Event) {
        assert!(
            event.kind == EventKind::ReadCommand,
            "read outcome expects the command phase"
        );
    }

    fn advance_write_pointer(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        phys: &Address,
        time: Time,
    ) {
        let wp = self.free_block_pointers[phys.package][phys.die];
        if wp.valid == ValidLevel::None || (wp.plane, wp.block) != (phys.plane, phys.block) {
            return;
        }
        let mut wp = wp;
        wp.page += 1;
        self.free_block_pointers[phys.package][phys.die] = wp;
        if wp.page < self.cfg.block_size {
            return;
        }
        let old = wp.block_id(&self.cfg);
        let next = self.find_free_unused_block_in_die(ssd, sched, phys.package, phys.die, time);
        if !next.is_none() {
            self.free_block_pointers[phys.package][phys.die] = next;
        }
        // The vacated block may have gone fully invalid while it was still
        // the pointer target; its erase was deferred until now.
        if ssd.block_by_id(old).pages_invalid() == self.cfg.block_size {
            self.remove_candidate(phys.package, phys.die, old);
            self.schedule_erase(sched, old, time);
        }
    }

    // -- free-pool draws ----------------------------------------------------

    /// Free block from anywhere on the device, or the `None` sentinel.
    pub fn find_free_unused_block(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        time: Time,
    ) -> Address {
        for package in 0..self.cfg.ssd_size {
            for die in 0..self.cfg.package_size {
                let address = self.find_free_unused_block_in_die(ssd, sched, package, die, time);
                if !address.is_none() {
                    return address;
                }
            }
        }
        Address::none()
    }

    pub fn find_free_unused_block_in_die(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        package: BaseType,
        die: BaseType,
        time: Time,
    ) -> Address {
        for klass in 0..self.cfg.num_age_classes {
            let address =
                self.find_free_unused_block_in_class(ssd, sched, package, die, klass, time);
            if !address.is_none() {
                return address;
            }
        }
        Address::none()
    }

    pub fn find_free_unused_block_in_class(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        package: BaseType,
        die: BaseType,
        klass: BaseType,
        time: Time,
    ) -> Address {
        assert!(klass < self.cfg.num_age_classes);
        let drawn = self.free_blocks[package][die][klass]
            .pop()
            .unwrap_or_else(Address::none);
        if self.cfg.greedy_gc && self.free_blocks[package][die][klass].len() < 2 {
            self.perform_gc_scoped(ssd, sched, package, die, klass, time);
        }
        drawn
    }

    /// Free block of the given wear class from any die.
    pub fn find_free_unused_block_with_class(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        klass: BaseType,
        time: Time,
    ) -> Address {
        assert!(klass < self.cfg.num_age_classes);
        for package in 0..self.cfg.ssd_size {
            for die in 0..self.cfg.package_size {
                if let Some(address) = self.free_blocks[package][die][klass].pop() {
                    if self.cfg.greedy_gc && self.free_blocks[package][die][klass].len() < 2 {
                        self.perform_gc_scoped(ssd, sched, package, die, klass, time);
                    }
                    return address;
                }
            }
        }
        Address::none()
    }

    // -- die selection ------------------------------------------------------

    /// The non-busy die with free pointer pages whose channel and die clear
    /// the soonest. Ties go to the die that finishes its own I/O earliest.
    pub fn get_free_die_with_shortest_io_queue(&self, ssd: &Ssd) -> Option<(BaseType, BaseType)> {
        let mut best = None;
        let mut shortest = Time::MAX;
        for package in 0..self.cfg.ssd_size {
            let mut earliest_die_finish = Time::MAX;
            let mut die_with_earliest_finish = 0;
            for die in 0..self.cfg.package_size {
                let wp = self.free_block_pointers[package][die];
                let has_free_pages = wp.valid != ValidLevel::None && wp.page < self.cfg.block_size;
                if !has_free_pages || ssd.register_is_busy(package, die) {
                    continue;
                }
                let channel_finish = ssd.channel_finish_time(package);
                let die_finish = ssd.die_finish_time(package, die);
                let finish = channel_finish.max(die_finish);
                if die_finish < earliest_die_finish {
                    earliest_die_finish = die_finish;
                    die_with_earliest_finish = die;
                }
                if finish < shortest || (finish == shortest && die_with_earliest_finish == die) {
                    best = Some((package, die));
                    shortest = finish;
                }
            }
        }
        best
    }

    /// Write-pointer address of the least busy die, or the `None` sentinel.
    pub fn get_free_die_write_pointer(&self, ssd: &Ssd) -> Address {
        match self.get_free_die_with_shortest_io_queue(ssd) {
            Some((package, die)) => self.free_block_pointers[package][die],
            None => Address::none(),
        }
    }

    /// Time until both the channel and the die behind `die_address` are clear.
    pub fn in_how_long_can_this_event_be_scheduled(
        &self,
        ssd: &Ssd,
        die_address: &Address,
        time_taken: Time,
    ) -> Time {
        let channel_finish = ssd.channel_finish_time(die_address.package);
        let die_finish = ssd.die_finish_time(die_address.package, die_address.die);
        (channel_finish.max(die_finish) - time_taken).max(0.0)
    }

    // -- garbage collection -------------------------------------------------

    /// Victim search across every candidate bucket on the device.
    pub fn perform_gc(&mut self, ssd: &mut Ssd, sched: &mut dyn IoScheduler, time: Time) {
        let mut buckets = Vec::new();
        for package in 0..self.cfg.ssd_size {
            for die in 0..self.cfg.package_size {
                for klass in 0..self.cfg.num_age_classes {
                    buckets.push((package, die, klass));
                }
            }
        }
        self.choose_gc_victim(ssd, sched, &buckets, time);
    }

    /// Victim search over all classes of one die.
    pub fn perform_gc_on_die(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        package: BaseType,
        die: BaseType,
        time: Time,
    ) {
        let buckets: Vec<_> = (0..self.cfg.num_age_classes)
            .map(|klass| (package, die, klass))
            .collect();
        self.choose_gc_victim(ssd, sched, &buckets, time);
    }

    /// Victim search for one wear class across all dies.
    pub fn perform_gc_on_class(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        klass: BaseType,
        time: Time,
    ) {
        let mut buckets = Vec::new();
        for package in 0..self.cfg.ssd_size {
            for die in 0..self.cfg.package_size {
                buckets.push((package, die, klass));
            }
        }
        self.choose_gc_victim(ssd, sched, &buckets, time);
    }

    /// Victim search over a single bucket.
    pub fn perform_gc_scoped(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        package: BaseType,
        die: BaseType,
        klass: BaseType,
        time: Time,
    ) {
        self.choose_gc_victim(ssd, sched, &[(package, die, klass)], time);
    }

    /// Emergency pass plus a per-die pass for every exhausted write pointer.
    pub fn check_if_should_trigger_more_gc(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        time: Time,
    ) {
        if self.num_free_pages <= self.cfg.block_size {
            self.perform_gc(ssd, sched, time);
        }
        for package in 0..self.cfg.ssd_size {
            for die in 0..self.cfg.package_size {
                let wp = self.free_block_pointers[package][die];
                if wp.valid != ValidLevel::None && wp.page < self.cfg.block_size {
                    continue;
                }
                let next = self.find_free_unused_block_in_die(ssd, sched, package, die, time);
                if !next.is_none() {
                    self.free_block_pointers[package][die] = next;
                    if wp.valid != ValidLevel::None {
                        let old = wp.block_id(&self.cfg);
                        if ssd.block_by_id(old).pages_invalid() == self.cfg.block_size {
                            self.remove_candidate(package, die, old);
                            self.schedule_erase(sched, old, time);
                        }
                    }
                } else {
                    self.perform_gc_scoped(ssd, sched, package, die, 0, time);
                }
            }
        }
    }

    fn choose_gc_victim(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        buckets: &[(BaseType, BaseType, BaseType)],
        time: Time,
    ) {
        let mut min_valid_pages = self.cfg.block_size;
        let mut best: Option<BlockId> = None;
        for &(package, die, klass) in buckets {
            for &bid in &self.gc_candidates[package][die][klass] {
                let valid = ssd.block_by_id(bid).pages_valid();
                if valid < min_valid_pages {
                    min_valid_pages = valid;
                    best = Some(bid);
                }
            }
        }
        let Some(victim) = best else { return };
        let a = block_address(&self.cfg, victim);
        let removed = self.remove_candidate(a.package, a.die, victim);
        assert!(removed, "GC victim at {} was not indexed as a candidate", a);
        debug!("GC victim at {} with {} valid pages", a, min_valid_pages);
        self.migrate(ssd, sched, victim, time);
    }

    /// Reads and rewrites every valid page of `victim` somewhere else, as one
    /// dependent read-then-write chain per page. The erase is issued by the
    /// write outcome hook once the last page has relocated. A victim with
    /// nothing to move is sealed and erased right here instead.
    pub fn migrate(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        victim: BlockId,
        time: Time,
    ) {
        let block = ssd.block_by_id(victim);
        let valid = block.pages_valid();
        assert!(
            block.state() != BlockState::Free && block.state() != BlockState::PartiallyFree,
            "migrating a free block at {}",
            block.physical_address()
        );
        assert!(
            valid <= self.num_available_pages_for_new_writes,
            "migration needs {} destination pages, only {} reservable",
            valid,
            self.num_available_pages_for_new_writes
        );
        self.num_available_pages_for_new_writes -= valid;
        self.migrating.insert(victim);
        let home = block_address(&self.cfg, victim);
        self.remove_candidate(home.package, home.die, victim);
        if valid == 0 {
            self.seal_and_schedule_erase(ssd, sched, victim, time);
            return;
        }
        let base = block_base(&self.cfg, victim);
        for i in 0..self.cfg.block_size {
            if ssd.block_by_id(victim).page_state(i) != PageState::Valid {
                continue;
            }
            let lba = self.lba_of[base + i]
                .unwrap_or_else(|| panic!("valid page {} holds no logical address", base + i));
            let addr = Address::from_linear(&self.cfg, base + i, ValidLevel::Page);
            let mut read = Event::new(EventKind::Read, Some(lba), time);
            read.physical_address = addr;
            read.is_garbage_collection_op = true;
            let mut write = Event::new(EventKind::Write, Some(lba), time);
            write.replace_address = addr;
            write.is_garbage_collection_op = true;
            sched.schedule_dependent_events(vec![read, write]);
        }
    }

    /// Takes a block the FTL no longer maps out of service: invalidates its
    /// remaining valid pages, seals its never-written ones and issues the
    /// erase. No-op when the block already went fully invalid through the
    /// replace path (the outcome hook has the erase in flight then).
    pub fn retire_block(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        addr: &Address,
        time: Time,
    ) {
        let bid = addr.block_id(&self.cfg);
        debug_assert!(!self.is_write_pointer(bid), "retiring an active write pointer");
        let state = ssd.block_by_id(bid).state();
        debug_assert!(state != BlockState::Free, "retiring a block that is already free");
        if state == BlockState::Inactive {
            return;
        }
        let base = block_base(&self.cfg, bid);
        for i in 0..self.cfg.block_size {
            if ssd.block_by_id(bid).page_state(i) == PageState::Valid {
                ssd.block_by_id_mut(bid).invalidate_page(i);
                self.lba_of[base + i] = None;
            }
        }
        self.remove_candidate(addr.package, addr.die, bid);
        self.seal_and_schedule_erase(ssd, sched, bid, time);
    }

    fn seal_and_schedule_erase(
        &mut self,
        ssd: &mut Ssd,
        sched: &mut dyn IoScheduler,
        bid: BlockId,
        time: Time,
    ) {
        let sealed = ssd.block_by_id_mut(bid).seal_empty_pages();
        assert!(self.num_free_pages >= sealed, "free-page counter underflow while sealing");
        assert!(
            self.num_available_pages_for_new_writes >= sealed,
            "available-page counter underflow while sealing"
        );
        self.num_free_pages -= sealed;
        self.num_available_pages_for_new_writes -= sealed;
        self.schedule_erase(sched, bid, time);
    }

    fn schedule_erase(&mut self, sched: &mut dyn IoScheduler, bid: BlockId, time: Time) {
        if !self.pending_erase.insert(bid) {
            return;
        }
        let mut erase = Event::new(EventKind::Erase, None, time);
        erase.physical_address = block_address(&self.cfg, bid);
        erase.is_garbage_collection_op = true;
        debug!("block at {} is fully invalid, issuing erase", erase.physical_address);
        sched.schedule_independent_event(erase);
    }

    // -- wear leveling ------------------------------------------------------

    /// Runs at erase registration. Widens `max_age` as needed, keeps the
    /// min-age set current, and when the wear spread crosses the threshold
    /// queues every least-worn block for migration. The queue then drains as
    /// far as reservable capacity allows.
    pub fn wear_level(&mut self, event: &Event, ssd: &mut Ssd, sched: &mut dyn IoScheduler) {
        let bid = event.physical_address.block_id(&self.cfg);
        let age = self.cfg.block_erases - ssd.block_by_id(bid).erases_remaining();
        if age > self.max_age {
            self.max_age = age;
            if self.max_age - self.min_age > self.cfg.wear_level_threshold
                && self.wl_queue.is_empty()
            {
                debug!(
                    "wear spread {} over threshold, queueing {} least-worn blocks",
                    self.max_age - self.min_age,
                    self.blocks_with_min_age.len()
                );
                for &b in &self.blocks_with_min_age {
                    self.wl_queue.push_back(b);
                }
                self.rescan_min_age(ssd);
            }
        } else if self.blocks_with_min_age.contains(&bid) && self.blocks_with_min_age.len() > 1 {
            self.blocks_with_min_age.remove(&bid);
        } else if self.blocks_with_min_age.contains(&bid) {
            self.blocks_with_min_age.remove(&bid);
            self.rescan_min_age(ssd);
        }

        while let Some(&front) = self.wl_queue.front() {
            let block = ssd.block_by_id(front);
            if block.state() != BlockState::Active
                || self.is_write_pointer(front)
                || self.migrating.contains(&front)
            {
                self.wl_queue.pop_front();
                continue;
            }
            if self.num_available_pages_for_new_writes > block.pages_valid() {
                self.wl_queue.pop_front();
                trace!("wear leveling migrates block at {}", block_address(&self.cfg, front));
                self.migrate(ssd, sched, front, event.completion_time());
            } else {
                break;
            }
        }
    }

    /// Rebuilds the min-age set, treating queued blocks as already promoted.
    fn rescan_min_age(&mut self, ssd: &Ssd) {
        self.blocks_with_min_age.clear();
        let mut new_min: Option<Counter> = None;
        for bid in 0..self.cfg.total_blocks() {
            if self.wl_queue.contains(&bid) {
                continue;
            }
            let age = self.cfg.block_erases - ssd.block_by_id(bid).erases_remaining();
            match new_min {
                Some(m) if age > m => {}
                Some(m) if age == m => {
                    self.blocks_with_min_age.insert(bid);
                }
                _ => {
                    new_min = Some(age);
                    self.blocks_with_min_age.clear();
                    self.blocks_with_min_age.insert(bid);
                }
            }
        }
        match new_min {
            Some(m) => self.min_age = m,
            None => self.min_age += 1,
        }
    }

    // -- candidate index ----------------------------------------------------

    fn is_write_pointer(&self, bid: BlockId) -> bool {
        for row in &self.free_block_pointers {
            for wp in row {
                if wp.valid != ValidLevel::None && wp.block_id(&self.cfg) == bid {
                    return true;
                }
            }
        }
        false
    }

    /// Insert under `klass`, first dropping any stale membership so a block
    /// never sits in two buckets of its die.
    fn insert_candidate(&mut self, package: BaseType, die: BaseType, klass: BaseType, bid: BlockId) {
        if self.migrating.contains(&bid) {
            return;
        }
        for k in 0..self.cfg.num_age_classes {
            if k != klass {
                self.gc_candidates[package][die][k].remove(&bid);
            }
        }
        if self.gc_candidates[package][die][klass].insert(bid) {
            trace!("block {} is now a GC candidate in class {}", bid, klass);
        }
    }

    fn remove_candidate(&mut self, package: BaseType, die: BaseType, bid: BlockId) -> bool {
        let mut removed = false;
        for klass in 0..self.cfg.num_age_classes {
            removed |= self.gc_candidates[package][die][klass].remove(&bid);
        }
        removed
    }

    // -- test-only invariant audit ------------------------------------------

    /// Counter coupling, free-pool conservation and bucket uniqueness,
    /// checked in one sweep.
    #[cfg(test)]
    pub(crate) fn audit(&self, ssd: &Ssd) {
        let b = self.cfg.block_size;
        assert!(self.num_available_pages_for_new_writes <= self.num_free_pages);
        assert!(self.num_free_pages <= self.cfg.total_pages());

        let mut pooled: BTreeSet<BlockId> = BTreeSet::new();
        let mut expected = 0;
        for row in &self.free_blocks {
            for per_die in row {
                for stack in per_die {
                    for a in stack {
                        assert!(
                            pooled.insert(a.block_id(&self.cfg)),
                            "block at {} pooled twice",
                            a
                        );
                        expected += b;
                    }
                }
            }
        }
        for row in &self.free_block_pointers {
            for wp in row {
                if wp.valid != ValidLevel::None {
                    assert!(
                        pooled.insert(wp.block_id(&self.cfg)),
                        "write pointer at {} also sits in a free pool",
                        wp
                    );
                    expected += b - wp.page.min(b);
                }
            }
        }
        for bid in 0..self.cfg.total_blocks() {
            if pooled.contains(&bid) {
                continue;
            }
            let blk = ssd.block_by_id(bid);
            expected += b - blk.pages_valid() - blk.pages_invalid();
        }
        assert_eq!(self.num_free_pages, expected, "free-page conservation violated");

        let mut seen: BTreeSet<BlockId> = BTreeSet::new();
        for row in &self.gc_candidates {
            for per_die in row {
                for bucket in per_die {
                    for &bid in bucket {
                        assert!(seen.insert(bid), "block {} sits in two candidate buckets", bid);
                        assert_eq!(
                            ssd.block_by_id(bid).state(),
                            BlockState::Active,
                            "candidate block {} is not active",
                            bid
                        );
                    }
                }
            }
        }
    }
}
