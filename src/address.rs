use crate::config::*;
use num_integer::div_rem;
use std::fmt;

/// Deepest component of an [`Address`] that carries meaning. Fields above the
/// level are ignored by consumers; `None` is the universal miss sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidLevel {
    None,
    Page,
    Block,
    Plane,
    Die,
    Package,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub package: BaseType,
    pub die: BaseType,
    pub plane: BaseType,
    pub block: BaseType,
    pub page: PageId,
    pub valid: ValidLevel,
}

impl Address {
    pub fn new(
        package: BaseType,
        die: BaseType,
        plane: BaseType,
        block: BaseType,
        page: PageId,
        valid: ValidLevel,
    ) -> Self {
        Address {
            package,
            die,
            plane,
            block,
            page,
            valid,
        }
    }

    pub fn none() -> Self {
        Address::new(0, 0, 0, 0, 0, ValidLevel::None)
    }

    pub fn is_none(&self) -> bool {
        self.valid == ValidLevel::None
    }

    /// Bijective linear encoding through the geometry radices.
    pub fn linear(&self, cfg: &Config) -> Addr {
        ((((self.package * cfg.package_size + self.die) * cfg.die_size + self.plane)
            * cfg.plane_size
            + self.block)
            * cfg.block_size)
            + self.page
    }

    pub fn from_linear(cfg: &Config, linear: Addr, valid: ValidLevel) -> Self {
        let (rest, page) = div_rem(linear, cfg.block_size);
        let (rest, block) = div_rem(rest, cfg.plane_size);
        let (rest, plane) = div_rem(rest, cfg.die_size);
        let (package, die) = div_rem(rest, cfg.package_size);
        debug_assert!(package < cfg.ssd_size, "linear address {} out of range", linear);
        Address::new(package, die, plane, block, page, valid)
    }

    /// Ordinal of the block this address falls in, across the whole device.
    pub fn block_id(&self, cfg: &Config) -> BlockId {
        self.linear(cfg) / cfg.block_size
    }

    /// Same tuple narrowed to block granularity.
    pub fn to_block_level(&self) -> Self {
        let mut a = *self;
        a.page = 0;
        a.valid = ValidLevel::Block;
        a
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{},{})",
            self.package, self.die, self.plane, self.block, self.page
        )
    }
}

/// Linear address of a block ordinal's first page.
pub fn block_base(cfg: &Config, block_id: BlockId) -> Addr {
    block_id * cfg.block_size
}

/// Address (page 0, block level) of a block ordinal.
pub fn block_address(cfg: &Config, block_id: BlockId) -> Address {
    Address::from_linear(cfg, block_base(cfg, block_id), ValidLevel::Block)
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg() -> Config {
        Config {
            ssd_size: 2,
            package_size: 3,
            die_size: 2,
            plane_size: 4,
            block_size: 8,
            ..Config::default()
        }
    }

    #[test]
    fn linear_round_trip() {
        let cfg = cfg();
        for linear in 0..cfg.total_pages() {
            let a = Address::from_linear(&cfg, linear, ValidLevel::Page);
            assert_eq!(a.linear(&cfg), linear);
        }
    }

    #[test]
    fn tuple_round_trip() {
        let cfg = cfg();
        let a = Address::new(1, 2, 1, 3, 5, ValidLevel::Page);
        let back = Address::from_linear(&cfg, a.linear(&cfg), ValidLevel::Page);
        assert_eq!(back, a);
    }

    #[test]
    fn validity_is_independent_of_fields() {
        let cfg = cfg();
        let a = Address::new(1, 2, 1, 3, 5, ValidLevel::Block);
        // Narrowing keeps the encoded fields intact.
        assert_eq!(a.to_block_level().block, 3);
        assert_eq!(a.linear(&cfg) / cfg.block_size, a.block_id(&cfg));
    }

    #[test]
    fn block_ordinal_mapping() {
        let cfg = cfg();
        let last = cfg.total_blocks() - 1;
        let a = block_address(&cfg, last);
        assert_eq!(a.page, 0);
        assert_eq!(a.valid, ValidLevel::Block);
        assert_eq!(a.block_id(&cfg), last);
        assert_eq!(block_base(&cfg, last), last * cfg.block_size);
    }

    #[test]
    fn none_sentinel() {
        assert!(Address::none().is_none());
        assert!(!block_address(&cfg(), 0).is_none());
    }
}
