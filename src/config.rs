use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

pub type BaseType = usize;

pub type Lpn = BaseType;
pub type PageId = BaseType;
pub type BlockId = BaseType;
pub type Counter = BaseType;
pub type Time = u64;

pub const CHANNELS: BaseType = 2;
pub const DIES: BaseType = 2;
pub const PLANES: BaseType = 1;
pub const BLOCKS: BaseType = 64;
pub const PAGES_PER_BLOCK: BaseType = 64;

pub const PAGE_SIZE: BaseType = 4096;

pub const MAX_ERASES: u32 = 10_000;
pub const AGE_CLASSES: BaseType = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("geometry field `{0}` must be non-zero")]
    ZeroGeometry(&'static str),
    #[error("num_age_classes must be at least 1")]
    NoAgeClasses,
    #[error("gc_reserve_blocks must be at least 1")]
    NoGcReserve,
    #[error("max_concurrent_gc must be at least 1")]
    NoGcConcurrency,
    #[error("over_provisioning must be within (0, 100), got {0}")]
    OverProvisioning(f64),
    #[error("queue_depth must be at least 1")]
    NoQueueDepth,
    #[error("reserve of {reserve} blocks leaves no room on a {total}-block device")]
    ReserveTooLarge { reserve: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    ShortestQueue,
    HotCold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CopyBackConfig {
    /// Consecutive copy-backs allowed for one logical page before a full
    /// read/write relocation is forced. Zero disables copy-back.
    pub max_repeats: u32,
    pub max_tracked_addresses: usize,
}

impl Default for CopyBackConfig {
    fn default() -> Self {
        CopyBackConfig {
            max_repeats: 0,
            max_tracked_addresses: 1024,
        }
    }
}

/// Latencies in simulated microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Latencies {
    pub read: Time,
    pub write: Time,
    pub erase: Time,
    pub copy_back: Time,
}

impl Default for Latencies {
    fn default() -> Self {
        Latencies {
            read: 25,
            write: 200,
            erase: 1500,
            copy_back: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channels: usize,
    pub dies_per_channel: usize,
    pub planes_per_die: usize,
    pub blocks_per_plane: usize,
    pub pages_per_block: usize,
    pub page_size: usize,

    pub max_erases: u32,
    pub num_age_classes: usize,
    pub over_provisioning: f64,

    /// Blocks worth of pages that application writes may never consume, so
    /// reclamation always has somewhere to migrate to.
    pub gc_reserve_blocks: usize,
    /// A LUN whose free-block count drops below this value asks for GC.
    pub greed_scale: usize,
    pub max_concurrent_gc: usize,
    pub copy_back: CopyBackConfig,
    pub wear_leveling_threshold: Option<u32>,

    pub latencies: Latencies,
    pub queue_depth: usize,
    pub policy: PolicyKind,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            channels: CHANNELS,
            dies_per_channel: DIES,
            planes_per_die: PLANES,
            blocks_per_plane: BLOCKS,
            pages_per_block: PAGES_PER_BLOCK,
            page_size: PAGE_SIZE,
            max_erases: MAX_ERASES,
            num_age_classes: AGE_CLASSES,
            over_provisioning: 7.0,
            gc_reserve_blocks: 2,
            greed_scale: 2,
            max_concurrent_gc: CHANNELS * DIES,
            copy_back: CopyBackConfig::default(),
            wear_leveling_threshold: None,
            latencies: Latencies::default(),
            queue_depth: 32,
            policy: PolicyKind::ShortestQueue,
        }
    }
}

impl Config {
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Config = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let geometry = [
            ("channels", self.channels),
            ("dies_per_channel", self.dies_per_channel),
            ("planes_per_die", self.planes_per_die),
            ("blocks_per_plane", self.blocks_per_plane),
            ("pages_per_block", self.pages_per_block),
            ("page_size", self.page_size),
        ];
        if let Some((name, _)) = geometry.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ZeroGeometry(name));
        }
        if self.num_age_classes == 0 {
            return Err(ConfigError::NoAgeClasses);
        }
        if self.gc_reserve_blocks == 0 {
            return Err(ConfigError::NoGcReserve);
        }
        if self.max_concurrent_gc == 0 {
            return Err(ConfigError::NoGcConcurrency);
        }
        if !(self.over_provisioning > 0.0 && self.over_provisioning < 100.0) {
            return Err(ConfigError::OverProvisioning(self.over_provisioning));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::NoQueueDepth);
        }
        // one pointer block per LUN plus the reserve must fit
        if self.gc_reserve_blocks + self.luns() >= self.total_blocks() {
            return Err(ConfigError::ReserveTooLarge {
                reserve: self.gc_reserve_blocks,
                total: self.total_blocks(),
            });
        }
        Ok(())
    }

    pub fn luns(&self) -> usize {
        self.channels * self.dies_per_channel
    }

    pub fn blocks_per_lun(&self) -> usize {
        self.planes_per_die * self.blocks_per_plane
    }

    pub fn total_blocks(&self) -> usize {
        self.luns() * self.blocks_per_lun()
    }

    pub fn total_pages(&self) -> usize {
        self.total_blocks() * self.pages_per_block
    }

    pub fn capacity_bytes(&self) -> usize {
        self.total_pages() * self.page_size
    }

    pub fn logical_pages(&self) -> usize {
        let op_pages = (self.total_pages() as f64 * (self.over_provisioning / 100.)).trunc() as usize;
        self.total_pages() - op_pages
    }

    pub fn gc_reserve_pages(&self) -> usize {
        self.gc_reserve_blocks * self.pages_per_block
    }
}
