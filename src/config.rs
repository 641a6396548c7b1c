pub type BaseType = usize;

pub type Addr = BaseType;
pub type PageId = BaseType;
pub type BlockId = BaseType;
pub type Counter = BaseType;
pub type Time = f64;

pub const PAGE_SIZE: BaseType = 4096;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("geometry dimension `{0}` must be non-zero")]
    ZeroDimension(&'static str),
    #[error("block_size must be a power of two, got {0}")]
    BlockSizeNotPowerOfTwo(BaseType),
    #[error("at least one age class is required")]
    NoAgeClasses,
    #[error("page_max_log must be non-zero")]
    NoLogBlocks,
}

/// Geometry, policy and timing knobs, injected everywhere instead of being
/// baked in as consts so a single binary can run differently sized devices.
#[derive(Debug, Clone)]
pub struct Config {
    /// Packages per SSD. One channel per package.
    pub ssd_size: BaseType,
    /// Dies per package.
    pub package_size: BaseType,
    /// Planes per die.
    pub die_size: BaseType,
    /// Blocks per plane.
    pub plane_size: BaseType,
    /// Pages per block.
    pub block_size: BaseType,
    /// Erase cycles a block survives.
    pub block_erases: Counter,
    /// Number of wear bins blocks are classified into.
    pub num_age_classes: BaseType,
    /// Upper bound on concurrently mapped random log blocks.
    pub page_max_log: BaseType,
    /// Refill a free-block stack through GC as soon as it runs low.
    pub greedy_gc: bool,
    /// Erase-count spread beyond which the least-worn blocks are migrated.
    pub wear_level_threshold: Counter,
    pub page_read_delay: Time,
    pub page_write_delay: Time,
    pub block_erase_delay: Time,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ssd_size: 1,
            package_size: 1,
            die_size: 4,
            plane_size: 64,
            block_size: 32,
            block_erases: 10_000,
            num_age_classes: 4,
            page_max_log: 4,
            greedy_gc: true,
            wear_level_threshold: 500,
            page_read_delay: 25.0,
            page_write_delay: 200.0,
            block_erase_delay: 1500.0,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, name) in [
            (self.ssd_size, "ssd_size"),
            (self.package_size, "package_size"),
            (self.die_size, "die_size"),
            (self.plane_size, "plane_size"),
            (self.block_size, "block_size"),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDimension(name));
            }
        }
        if !self.block_size.is_power_of_two() {
            return Err(ConfigError::BlockSizeNotPowerOfTwo(self.block_size));
        }
        if self.num_age_classes == 0 {
            return Err(ConfigError::NoAgeClasses);
        }
        if self.page_max_log == 0 {
            return Err(ConfigError::NoLogBlocks);
        }
        Ok(())
    }

    pub fn blocks_per_die(&self) -> BaseType {
        self.die_size * self.plane_size
    }

    pub fn total_blocks(&self) -> BaseType {
        self.ssd_size * self.package_size * self.blocks_per_die()
    }

    pub fn total_pages(&self) -> BaseType {
        self.total_blocks() * self.block_size
    }
}
