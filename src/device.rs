use crate::address::{Address, ValidLevel};
use crate::config::*;
use crate::event::{Event, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Empty,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    PartiallyFree,
    Active,
    Inactive,
}

#[derive(Debug)]
pub struct Block {
    pages: Vec<PageState>,
    pages_valid: Counter,
    pages_invalid: Counter,
    erases_remaining: Counter,
    state: BlockState,
    physical_address: Addr,
}

impl Block {
    fn new(physical_address: Addr, cfg: &Config) -> Self {
        Block {
            pages: vec![PageState::Empty; cfg.block_size],
            pages_valid: 0,
            pages_invalid: 0,
            erases_remaining: cfg.block_erases,
            state: BlockState::Free,
            physical_address,
        }
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn pages_valid(&self) -> Counter {
        self.pages_valid
    }

    pub fn pages_invalid(&self) -> Counter {
        self.pages_invalid
    }

    pub fn erases_remaining(&self) -> Counter {
        self.erases_remaining
    }

    pub fn physical_address(&self) -> Addr {
        self.physical_address
    }

    pub fn page_state(&self, page: PageId) -> PageState {
        self.pages[page]
    }

    pub fn write_page(&mut self, page: PageId) {
        debug_assert!(
            self.pages[page] == PageState::Empty,
            "double program of page {} in block at {}",
            page,
            self.physical_address
        );
        self.pages[page] = PageState::Valid;
        self.pages_valid += 1;
        self.state = BlockState::Active;
    }

    pub fn invalidate_page(&mut self, page: PageId) {
        debug_assert!(
            self.pages[page] == PageState::Valid,
            "invalidating non-valid page {} in block at {}",
            page,
            self.physical_address
        );
        self.pages[page] = PageState::Invalid;
        self.pages_valid -= 1;
        self.pages_invalid += 1;
        if self.pages_invalid == self.pages.len() {
            self.state = BlockState::Inactive;
        }
    }

    /// Marks every never-written page invalid so the block can take the
    /// fully-invalid erase path. Returns how many pages were sealed.
    pub fn seal_empty_pages(&mut self) -> Counter {
        let mut sealed = 0;
        for page in self.pages.iter_mut() {
            if *page == PageState::Empty {
                *page = PageState::Invalid;
                sealed += 1;
            }
        }
        self.pages_invalid += sealed;
        if self.pages_invalid == self.pages.len() {
            self.state = BlockState::Inactive;
        }
        sealed
    }

    pub fn erase(&mut self) {
        assert!(self.erases_remaining > 0, "erase budget exhausted at {}", self.physical_address);
        debug_assert!(
            self.pages_invalid == self.pages.len(),
            "erasing block at {} with live pages",
            self.physical_address
        );
        for page in self.pages.iter_mut() {
            *page = PageState::Empty;
        }
        self.pages_valid = 0;
        self.pages_invalid = 0;
        self.erases_remaining -= 1;
        self.state = BlockState::Free;
    }

    #[cfg(test)]
    pub fn set_erases_remaining(&mut self, erases_remaining: Counter) {
        self.erases_remaining = erases_remaining;
    }
}

#[derive(Debug)]
struct Plane {
    blocks: Vec<Block>,
}

#[derive(Debug)]
struct Die {
    planes: Vec<Plane>,
    register_busy: bool,
    io_finish_time: Time,
}

#[derive(Debug)]
struct Package {
    dies: Vec<Die>,
}

#[derive(Debug)]
struct Channel {
    finish_time: Time,
}

/// The device arena. The core addresses into it with linear indices and
/// block ordinals; nothing outside this module holds a reference into it.
#[derive(Debug)]
pub struct Ssd {
    cfg: Config,
    packages: Vec<Package>,
    channels: Vec<Channel>,
}

impl Ssd {
    pub fn new(cfg: &Config) -> Self {
        let mut packages = Vec::with_capacity(cfg.ssd_size);
        for i in 0..cfg.ssd_size {
            let mut dies = Vec::with_capacity(cfg.package_size);
            for j in 0..cfg.package_size {
                let mut planes = Vec::with_capacity(cfg.die_size);
                for t in 0..cfg.die_size {
                    let mut blocks = Vec::with_capacity(cfg.plane_size);
                    for b in 0..cfg.plane_size {
                        let base =
                            Address::new(i, j, t, b, 0, ValidLevel::Block).linear(cfg);
                        blocks.push(Block::new(base, cfg));
                    }
                    planes.push(Plane { blocks });
                }
                dies.push(Die {
                    planes,
                    register_busy: false,
                    io_finish_time: 0.0,
                });
            }
            packages.push(Package { dies });
        }
        let channels = (0..cfg.ssd_size).map(|_| Channel { finish_time: 0.0 }).collect();
        Ssd {
            cfg: cfg.clone(),
            packages,
            channels,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn block(&self, a: &Address) -> &Block {
        &self.packages[a.package].dies[a.die].planes[a.plane].blocks[a.block]
    }

    pub fn block_mut(&mut self, a: &Address) -> &mut Block {
        &mut self.packages[a.package].dies[a.die].planes[a.plane].blocks[a.block]
    }

    pub fn block_by_id(&self, block_id: BlockId) -> &Block {
        self.block(&crate::address::block_address(&self.cfg, block_id))
    }

    pub fn block_by_id_mut(&mut self, block_id: BlockId) -> &mut Block {
        let a = crate::address::block_address(&self.cfg, block_id);
        self.block_mut(&a)
    }

    pub fn register_is_busy(&self, package: BaseType, die: BaseType) -> bool {
        self.packages[package].dies[die].register_busy
    }

    pub fn set_register_busy(&mut self, package: BaseType, die: BaseType, busy: bool) {
        self.packages[package].dies[die].register_busy = busy;
    }

    pub fn die_finish_time(&self, package: BaseType, die: BaseType) -> Time {
        self.packages[package].dies[die].io_finish_time
    }

    pub fn channel_finish_time(&self, package: BaseType) -> Time {
        self.channels[package].finish_time
    }

    /// Applies an event to the device: programs/erases the target, stamps
    /// the duration from the configured latencies and pushes the channel and
    /// die finish times forward.
    pub fn issue(&mut self, event: &mut Event) {
        let a = event.physical_address;
        debug_assert!(a.valid != ValidLevel::None, "issuing event without a target");
        event.duration = match event.kind {
            EventKind::Write => {
                self.block_mut(&a).write_page(a.page);
                self.cfg.page_write_delay
            }
            EventKind::Read | EventKind::ReadCommand => self.cfg.page_read_delay,
            EventKind::Erase => {
                self.block_mut(&a).erase();
                self.cfg.block_erase_delay
            }
        };
        let done = event.completion_time();
        self.channels[a.package].finish_time = done;
        self.packages[a.package].dies[a.die].io_finish_time = done;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg() -> Config {
        Config {
            ssd_size: 1,
            package_size: 2,
            die_size: 1,
            plane_size: 2,
            block_size: 4,
            block_erases: 10,
            ..Config::default()
        }
    }

    #[test]
    fn block_lifecycle() {
        let cfg = cfg();
        let mut ssd = Ssd::new(&cfg);
        let b = ssd.block_by_id_mut(0);
        assert_eq!(b.state(), BlockState::Free);

        for i in 0..4 {
            b.write_page(i);
        }
        assert_eq!(b.state(), BlockState::Active);
        assert_eq!(b.pages_valid(), 4);

        for i in 0..4 {
            b.invalidate_page(i);
        }
        assert_eq!(b.state(), BlockState::Inactive);
        assert_eq!(b.pages_invalid(), 4);

        b.erase();
        assert_eq!(b.state(), BlockState::Free);
        assert_eq!(b.erases_remaining(), 9);
        assert_eq!(b.page_state(0), PageState::Empty);
    }

    #[test]
    fn seal_counts_only_empty_pages() {
        let cfg = cfg();
        let mut ssd = Ssd::new(&cfg);
        let b = ssd.block_by_id_mut(1);
        b.write_page(0);
        b.write_page(1);
        b.invalidate_page(0);
        assert_eq!(b.seal_empty_pages(), 2);
        // One page is still valid, so the block stays active.
        assert_eq!(b.state(), BlockState::Active);
        b.invalidate_page(1);
        assert_eq!(b.state(), BlockState::Inactive);
    }

    #[test]
    fn issue_advances_finish_times() {
        let cfg = cfg();
        let mut ssd = Ssd::new(&cfg);
        let mut w = Event::new(EventKind::Write, Some(0), 1000.0);
        w.physical_address = Address::new(0, 1, 0, 0, 0, ValidLevel::Page);
        ssd.issue(&mut w);
        assert_eq!(w.duration, cfg.page_write_delay);
        assert_eq!(ssd.channel_finish_time(0), 1000.0 + cfg.page_write_delay);
        assert_eq!(ssd.die_finish_time(0, 1), 1000.0 + cfg.page_write_delay);
        assert_eq!(ssd.die_finish_time(0, 0), 0.0);
    }

    #[test]
    fn block_ordinals_cover_the_device() {
        let cfg = cfg();
        let ssd = Ssd::new(&cfg);
        for id in 0..cfg.total_blocks() {
            assert_eq!(ssd.block_by_id(id).physical_address(), id * cfg.block_size);
        }
    }
}
