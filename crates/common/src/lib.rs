
use serde::{Deserialize, Serialize};
use std::{fmt, io};
use thiserror::Error;

/// Hard limit on key length imposed by the one-byte length prefix.
pub const MAX_KEY_LEN: usize = 255;

/// Hard limit on value length imposed by the one-byte length prefix.
pub const MAX_VALUE_LEN: usize = 255;

/// Default page size for the staging tree. Record offsets within a page are
/// 16-bit, so this is the largest power of two that leaves the full offset
/// range usable.
pub const DEFAULT_STAGING_PAGE_SIZE: usize = 32 * 1024;

/// Default page size for the bucket trees.
pub const DEFAULT_BUCKET_PAGE_SIZE: usize = 4096;

/// Logical identifier for a page within a single backing file.
/// Examples:
/// - `let root = PageNo::ROOT;`
/// - `let leaf = PageNo(42);`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageNo(pub u32);

impl PageNo {
    /// Page 0 holds the root node and is pinned for the life of the cache.
    pub const ROOT: PageNo = PageNo(0);
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical error type shared across store subsystems.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key length {0} exceeds {MAX_KEY_LEN} bytes")]
    KeyTooLarge(usize),
    #[error("value length {0} exceeds {1} bytes")]
    ValueTooLarge(usize, usize),
    #[error("cache: {0}")]
    Cache(String),
    #[error("bloom: {0}")]
    Bloom(String),
    #[error("corrupt node: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `StoreError`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Page cache telemetry.
///
/// `requests` and `misses` are counted once the cache is at capacity, so the
/// derived miss rate reflects steady-state traffic rather than warm-up fills.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub requests: u64,
    pub misses: u64,
    pub flushes: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    /// Current adaptive flush batch target, in pages.
    pub flush_target: usize,
}

/// Per-bucket lookup accounting: probes issued, probes admitted by the
/// bucket's Bloom filter, and confirmed hits.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbeCounters {
    pub lookups: u64,
    pub bloom_pass: u64,
    pub hits: u64,
}

/// Runtime configuration for a tiered store.
///
/// # Example
/// ```
/// use common::StoreConfig;
///
/// let config = StoreConfig::builder()
///     .staging_cache_mb(2)
///     .hot_rotation_limit(1_000_000)
///     .bloom_filters(true)
///     .build();
/// assert_eq!(config.staging_cache_mb, 2);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct StoreConfig {
    /// Staging tree cache budget in MiB.
    #[builder(default = 1)]
    pub staging_cache_mb: u32,
    /// Hot bucket cache budget in MiB.
    #[builder(default = 1)]
    pub hot_cache_mb: u32,
    /// Cold bucket cache budget in MiB.
    #[builder(default = 1)]
    pub cold_cache_mb: u32,
    /// Aged bucket cache budget in MiB. Zero disables rotation.
    #[builder(default = 1)]
    pub aged_cache_mb: u32,
    /// Hot bucket entry count that triggers a rotation.
    #[builder(default = 250_000_000)]
    pub hot_rotation_limit: u64,
    /// Page size of the staging tree. Must not exceed 64 KiB.
    #[builder(default = DEFAULT_STAGING_PAGE_SIZE)]
    pub staging_page_size: usize,
    /// Page size of the hot, cold and aged bucket trees.
    #[builder(default = DEFAULT_BUCKET_PAGE_SIZE)]
    pub bucket_page_size: usize,
    /// Explicit staging cache size in pages; zero derives it from
    /// `staging_cache_mb`.
    #[builder(default = 0)]
    pub staging_cache_pages: usize,
    /// Guard bucket lookups with Bloom filters.
    #[builder(default = true)]
    pub bloom_filters: bool,
    /// Target false-positive rate for every Bloom filter.
    #[builder(default = 0.005)]
    pub bloom_fp_rate: f64,
    /// Declared capacity of the hot bucket filter; zero means "use the
    /// rotation limit".
    #[builder(default = 0)]
    pub hot_bloom_capacity: u64,
    /// Declared capacity of the cold bucket filter.
    #[builder(default = 30_000_000)]
    pub cold_bloom_capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl StoreConfig {
    /// Decode the packed 32-bit cache knob: bits 0-7 staging MiB, 8-15
    /// rotation threshold in millions of entries, 16-23 hot MiB, 24-27 aged
    /// MiB, 28-31 cold MiB. Low fields double as fall-backs while the high
    /// fields are absent.
    pub fn from_knob(raw: u32) -> Self {
        let staging_mb = if raw > 0xFF { raw & 0xFF } else { raw };
        let rotation_mil = if raw > 0xFF { (raw >> 8) & 0xFF } else { 250 };
        let hot_mb = if raw > 0xFFFF { (raw >> 16) & 0xFF } else { raw & 0xFF };
        let aged_mb = if raw > 0xFF_FFFF {
            (raw >> 24) & 0x0F
        } else {
            (raw & 0xFF) / (if raw < 4 { 2 } else { 4 })
        };
        let cold_mb = if raw > 0xFFF_FFFF { (raw >> 28) & 0x0F } else { raw & 0xFF };
        Self::builder()
            .staging_cache_mb(staging_mb.max(1))
            .hot_cache_mb(hot_mb.max(1))
            .cold_cache_mb(cold_mb.max(1))
            .aged_cache_mb(aged_mb)
            .hot_rotation_limit(rotation_mil as u64 * 1_000_000)
            .build()
    }

    pub fn staging_cache_pages(&self) -> usize {
        if self.staging_cache_pages > 0 {
            return self.staging_cache_pages;
        }
        pages_for(self.staging_cache_mb, self.staging_page_size)
    }

    pub fn hot_cache_pages(&self) -> usize {
        pages_for(self.hot_cache_mb, self.bucket_page_size)
    }

    pub fn cold_cache_pages(&self) -> usize {
        pages_for(self.cold_cache_mb, self.bucket_page_size)
    }

    pub fn aged_cache_pages(&self) -> usize {
        pages_for(self.aged_cache_mb, self.bucket_page_size)
    }

    pub fn hot_bloom_entries(&self) -> u64 {
        if self.hot_bloom_capacity > 0 {
            self.hot_bloom_capacity
        } else {
            self.hot_rotation_limit.max(1)
        }
    }
}

fn pages_for(mb: u32, page_size: usize) -> usize {
    ((mb as usize * 1024 * 1024) / page_size).max(4)
}
