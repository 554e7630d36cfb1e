//! Tiered write-absorption store.
//!
//! Writes land in a large-paged staging B+tree whose records carry a one-byte
//! hit counter. When the staging leaf for the incoming key is full and the
//! staging cache is saturated, a demotion sweep walks the leaf in frequency
//! tiers: rarely touched entries move to the hot bucket tree, repeatedly
//! touched ones to the cold bucket tree, and survivors age. The hot bucket is
//! rotated to a numbered sibling file when it crosses the configured entry
//! limit, producing a chain of aged buckets probed most-recent-first.
//!
//! Reads probe staging, then cold, then hot, then each aged bucket; every
//! probe below staging is short-circuited by that bucket's Bloom filter when
//! filters are enabled.
//!
//! # Example
//!
//! ```no_run
//! use common::StoreConfig;
//! use logger::Store;
//!
//! let mut store = Store::open("/tmp/t.db", StoreConfig::default()).unwrap();
//! store.put(b"apple", b"1").unwrap();
//! assert_eq!(store.get(b"apple").unwrap(), Some(b"1".to_vec()));
//! store.close().unwrap();
//! ```
//!
//! Storage layout for a store opened on `path`:
//!
//! | file | contents |
//! |------|----------|
//! | `path.ix0` | staging tree |
//! | `path.ix1` | hot bucket tree |
//! | `path.ix2` | cold bucket tree |
//! | `path.ix1.N` | aged hot bucket, N from 1, higher is newer |
//! | `*.blm` | Bloom sidecar of the matching tree |

#[cfg(test)]
mod tests;

use bloom::{BloomFilter, Membership};
use btree::BpTree;
use common::{
    CacheStats, PageNo, ProbeCounters, StoreConfig, StoreError, StoreResult, MAX_KEY_LEN,
    MAX_VALUE_LEN,
};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Staging hit counters saturate here.
const COUNTER_MAX: u8 = 255;
/// Telemetry dump cadence, in puts.
const TELEMETRY_EVERY: u64 = 5_000_000;

/// What a put did to the staging tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutStatus {
    /// The key was not in staging.
    Inserted,
    /// The key was already staged; its hit counter was bumped.
    Updated,
}

/// Single-writer tiered key/value store.
pub struct Store {
    staging: BpTree,
    hot: BpTree,
    cold: BpTree,
    /// Aged hot buckets, most recently rotated first.
    aged: Vec<BpTree>,
    hot_bloom: Option<BloomFilter>,
    cold_bloom: Option<BloomFilter>,
    aged_blooms: Vec<Option<BloomFilter>>,
    hot_counters: ProbeCounters,
    cold_counters: ProbeCounters,
    aged_counters: Vec<ProbeCounters>,
    /// Demotion sweeps per staging page.
    flush_counts: Vec<u32>,
    staging_saturated: bool,
    puts: u64,
    config: StoreConfig,
    base: PathBuf,
    closed: bool,
}

impl Store {
    /// Open or create a store rooted at `path`, recovering any aged bucket
    /// chain left by earlier rotations.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let base = path.as_ref().to_path_buf();
        let staging_page = config.staging_page_size;
        let bucket_page = config.bucket_page_size;
        let staging = BpTree::open(
            &suffixed(&base, ".ix0"),
            staging_page,
            staging_page,
            config.staging_cache_pages(),
        )?;
        let hot = BpTree::open(
            &suffixed(&base, ".ix1"),
            bucket_page,
            bucket_page,
            config.hot_cache_pages(),
        )?;
        let cold = BpTree::open(
            &suffixed(&base, ".ix2"),
            bucket_page,
            bucket_page,
            config.cold_cache_pages(),
        )?;
        let hot_bloom = if config.bloom_filters {
            Some(import_or_new(
                &suffixed(&base, ".ix1.blm"),
                config.hot_bloom_entries(),
                config.bloom_fp_rate,
            )?)
        } else {
            None
        };
        let cold_bloom = if config.bloom_filters {
            Some(import_or_new(
                &suffixed(&base, ".ix2.blm"),
                config.cold_bloom_capacity,
                config.bloom_fp_rate,
            )?)
        } else {
            None
        };

        // Recover the aged chain by probing numbered siblings, then flip it
        // so the most recently rotated bucket is probed first.
        let mut aged = Vec::new();
        let mut aged_blooms = Vec::new();
        let mut n = 1u32;
        loop {
            let aged_path = suffixed(&base, &format!(".ix1.{n}"));
            if !aged_path.exists() {
                break;
            }
            aged.push(BpTree::open(
                &aged_path,
                bucket_page,
                bucket_page,
                config.aged_cache_pages(),
            )?);
            aged_blooms.push(if config.bloom_filters {
                Some(import_or_new(
                    &suffixed(&base, &format!(".ix1.{n}.blm")),
                    config.hot_bloom_entries(),
                    config.bloom_fp_rate,
                )?)
            } else {
                None
            });
            n += 1;
        }
        aged.reverse();
        aged_blooms.reverse();

        info!(
            "store open: staging cache {} pages of {}, {} aged buckets",
            config.staging_cache_pages(),
            staging_page,
            aged.len()
        );

        let aged_counters = vec![ProbeCounters::default(); aged.len()];
        Ok(Self {
            staging,
            hot,
            cold,
            aged,
            hot_bloom,
            cold_bloom,
            aged_blooms,
            hot_counters: ProbeCounters::default(),
            cold_counters: ProbeCounters::default(),
            aged_counters,
            flush_counts: Vec::new(),
            staging_saturated: false,
            puts: 0,
            config,
            base,
            closed: false,
        })
    }

    /// Open with the packed 32-bit cache knob instead of a config.
    pub fn open_with_knob(path: impl AsRef<Path>, knob: u32) -> StoreResult<Self> {
        Self::open(path, StoreConfig::from_knob(knob))
    }

    /// Stage a write. The staged record is the value with a one-byte hit
    /// counter appended, so values may be at most 254 bytes here.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<PutStatus> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::KeyTooLarge(key.len()));
        }
        if value.len() > MAX_VALUE_LEN - 1 {
            return Err(StoreError::ValueTooLarge(value.len(), MAX_VALUE_LEN - 1));
        }
        self.puts += 1;
        if self.puts % TELEMETRY_EVERY == 0 {
            self.dump_telemetry();
        }
        if self.staging.cache_page_count() as usize >= self.staging.cache_capacity() {
            self.staging_saturated = true;
        }

        let (leaf, slot) = self.staging.locate(key)?;
        let prior = match slot {
            Ok(pos) => Some(self.staging.leaf_value(leaf, pos)?),
            Err(_) => None,
        };
        let full = self
            .staging
            .leaf_would_overflow(leaf, key.len(), value.len() + 1)?;
        if full && self.staging_saturated {
            self.demote_leaf(leaf)?;
            let page = leaf.0 as usize;
            if page >= self.flush_counts.len() {
                self.flush_counts.resize(page + 1, 0);
            }
            self.flush_counts[page] = self.flush_counts[page].saturating_add(1);
        }

        let mut staged = Vec::with_capacity(value.len() + 1);
        staged.extend_from_slice(value);
        let counter = match &prior {
            Some(v) => v.last().copied().unwrap_or(0).min(COUNTER_MAX - 1) + 1,
            None => 1,
        };
        staged.push(counter);

        if prior.is_none() {
            self.staging.put(key, &staged)?;
            return Ok(PutStatus::Inserted);
        }
        // the sweep may have moved or demoted the key; re-locate before the
        // in-place rewrite
        let (leaf, slot) = self.staging.locate(key)?;
        match slot {
            Ok(pos) => {
                let current_len = self.staging.leaf_value(leaf, pos)?.len();
                if current_len == staged.len() {
                    self.staging
                        .leaf_value_mut(leaf, pos, |v| v.copy_from_slice(&staged))?;
                } else {
                    self.staging.leaf_remove(leaf, pos)?;
                    self.staging.put(key, &staged)?;
                }
            }
            Err(_) => {
                self.staging.put(key, &staged)?;
            }
        }
        Ok(PutStatus::Updated)
    }

    /// Probe staging, then cold, then hot, then the aged chain.
    pub fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::KeyTooLarge(key.len()));
        }
        if let Some(staged) = self.staging.get(key)? {
            return Ok(Some(staged[..staged.len() - 1].to_vec()));
        }
        self.cold_counters.lookups += 1;
        if bloom_admits(self.cold_bloom.as_mut(), key) {
            self.cold_counters.bloom_pass += 1;
            if let Some(value) = self.cold.get(key)? {
                self.cold_counters.hits += 1;
                return Ok(Some(value));
            }
        }
        self.hot_counters.lookups += 1;
        if bloom_admits(self.hot_bloom.as_mut(), key) {
            self.hot_counters.bloom_pass += 1;
            if let Some(value) = self.hot.get(key)? {
                self.hot_counters.hits += 1;
                return Ok(Some(value));
            }
        }
        for i in 0..self.aged.len() {
            self.aged_counters[i].lookups += 1;
            if bloom_admits(self.aged_blooms[i].as_mut(), key) {
                self.aged_counters[i].bloom_pass += 1;
                if let Some(value) = self.aged[i].get(key)? {
                    self.aged_counters[i].hits += 1;
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// Flush every tree and export every live Bloom filter.
    pub fn close(mut self) -> StoreResult<()> {
        self.close_inner()
    }

    /// Entries inserted across staging and the live buckets since open.
    pub fn size(&self) -> u64 {
        self.staging.entry_count() + self.hot.entry_count() + self.cold.entry_count()
    }

    pub fn hot_len(&self) -> u64 {
        self.hot.entry_count()
    }

    pub fn cold_len(&self) -> u64 {
        self.cold.entry_count()
    }

    pub fn aged_count(&self) -> usize {
        self.aged.len()
    }

    pub fn max_key_len(&self) -> usize {
        self.staging
            .max_key_len()
            .max(self.hot.max_key_len())
            .max(self.cold.max_key_len())
    }

    pub fn hot_probe_counters(&self) -> ProbeCounters {
        self.hot_counters
    }

    pub fn cold_probe_counters(&self) -> ProbeCounters {
        self.cold_counters
    }

    pub fn aged_probe_counters(&self) -> &[ProbeCounters] {
        &self.aged_counters
    }

    pub fn staging_cache_stats(&self) -> CacheStats {
        self.staging.cache_stats()
    }

    /// Demotion sweeps per staging page number.
    pub fn flush_counts(&self) -> &[u32] {
        &self.flush_counts
    }

    /// Sweep one staging leaf down to a third of its entries, demoting by
    /// frequency tier: counter 1 entries to the hot bucket, higher counters
    /// to the cold bucket; surviving counters above 2 age by one. Finally
    /// repack the leaf.
    fn demote_leaf(&mut self, leaf: PageNo) -> StoreResult<()> {
        let start_len = self.staging.leaf_len(leaf)?;
        let target = start_len / 3;
        debug!("demotion sweep of staging page {leaf}: {start_len} entries, target {target}");
        let mut cur: u8 = 1;
        let mut next_min: u8 = COUNTER_MAX;
        while self.staging.leaf_len(leaf)? > target {
            let mut pos = 0;
            loop {
                if pos >= self.staging.leaf_len(leaf)? {
                    break;
                }
                let (key, value) = self.staging.leaf_entry(leaf, pos)?;
                let counter = value.last().copied().unwrap_or(1);
                if counter <= cur {
                    let user_value = &value[..value.len() - 1];
                    if counter <= 1 {
                        self.demote_hot(&key, user_value)?;
                    } else {
                        self.demote_cold(&key, user_value)?;
                    }
                    self.staging.leaf_remove(leaf, pos)?;
                } else {
                    if counter < next_min {
                        next_min = counter;
                    }
                    if counter > 2 {
                        self.staging.leaf_value_mut(leaf, pos, |v| {
                            let last = v.len() - 1;
                            v[last] -= 1;
                        })?;
                    }
                    pos += 1;
                }
                if self.staging.leaf_len(leaf)? <= target && cur > 1 {
                    break;
                }
            }
            cur = if cur == next_min { COUNTER_MAX } else { next_min };
        }
        self.staging.leaf_compact(leaf)?;
        Ok(())
    }

    fn demote_hot(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let inserted = self.hot.put(key, value)?.is_none();
        if inserted {
            if let Some(filter) = self.hot_bloom.as_mut() {
                filter.add(key);
            }
        }
        self.rotate_hot_if_full()
    }

    fn demote_cold(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let inserted = self.cold.put(key, value)?.is_none();
        if inserted {
            if let Some(filter) = self.cold_bloom.as_mut() {
                filter.add(key);
            }
        }
        Ok(())
    }

    /// Rotate the hot bucket once it crosses the entry limit: rename its file
    /// and Bloom sidecar to the next aged slot, prepend the handle to the
    /// aged chain and start a fresh hot bucket.
    fn rotate_hot_if_full(&mut self) -> StoreResult<()> {
        if self.config.aged_cache_mb == 0
            || self.hot.entry_count() < self.config.hot_rotation_limit
        {
            return Ok(());
        }
        let slot = self.aged.len() + 1;
        info!(
            "rotating hot bucket into aged slot {slot} at {} entries",
            self.hot.entry_count()
        );
        self.hot.close()?;
        let hot_path = suffixed(&self.base, ".ix1");
        let hot_bloom_path = suffixed(&self.base, ".ix1.blm");
        let aged_path = suffixed(&self.base, &format!(".ix1.{slot}"));
        if let Some(filter) = self.hot_bloom.as_ref() {
            filter.export(&hot_bloom_path)?;
        }
        fs::rename(&hot_path, &aged_path)?;
        if self.config.bloom_filters && hot_bloom_path.exists() {
            fs::rename(
                &hot_bloom_path,
                suffixed(&self.base, &format!(".ix1.{slot}.blm")),
            )?;
        }
        let bucket_page = self.config.bucket_page_size;
        let aged_tree = BpTree::open(
            &aged_path,
            bucket_page,
            bucket_page,
            self.config.aged_cache_pages(),
        )?;
        let fresh = BpTree::open(
            &hot_path,
            bucket_page,
            bucket_page,
            self.config.hot_cache_pages(),
        )?;
        let _old = std::mem::replace(&mut self.hot, fresh);
        self.aged.insert(0, aged_tree);
        let old_bloom = if self.config.bloom_filters {
            self.hot_bloom.replace(BloomFilter::with_capacity(
                self.config.hot_bloom_entries(),
                self.config.bloom_fp_rate,
            ))
        } else {
            None
        };
        self.aged_blooms.insert(0, old_bloom);
        self.aged_counters
            .insert(0, std::mem::take(&mut self.hot_counters));
        Ok(())
    }

    fn close_inner(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.staging.close()?;
        self.hot.close()?;
        self.cold.close()?;
        for tree in &mut self.aged {
            tree.close()?;
        }
        // a filter nothing was ever added to answers exactly like the fresh
        // one the next open would build, so it need not hit the disk
        if let Some(filter) = &self.hot_bloom {
            if filter.inserted() > 0 {
                filter.export(&suffixed(&self.base, ".ix1.blm"))?;
            }
        }
        if let Some(filter) = &self.cold_bloom {
            if filter.inserted() > 0 {
                filter.export(&suffixed(&self.base, ".ix2.blm"))?;
            }
        }
        let chain_len = self.aged_blooms.len();
        for (i, filter) in self.aged_blooms.iter().enumerate() {
            if let Some(filter) = filter {
                // position 0 is the newest rotation, i.e. the highest number
                let slot = chain_len - i;
                if filter.inserted() > 0 {
                    filter.export(&suffixed(&self.base, &format!(".ix1.{slot}.blm")))?;
                }
            }
        }
        self.closed = true;
        Ok(())
    }

    fn dump_telemetry(&self) {
        debug!(
            "cold bucket: {} lookups, {} bloom-pass, {} hits",
            self.cold_counters.lookups, self.cold_counters.bloom_pass, self.cold_counters.hits
        );
        debug!(
            "hot bucket: {} lookups, {} bloom-pass, {} hits",
            self.hot_counters.lookups, self.hot_counters.bloom_pass, self.hot_counters.hits
        );
        for (i, counters) in self.aged_counters.iter().enumerate() {
            debug!(
                "aged bucket {i}: {} lookups, {} bloom-pass, {} hits",
                counters.lookups, counters.bloom_pass, counters.hits
            );
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_inner() {
                warn!("store write-back on drop failed: {e}");
            }
        }
    }
}

fn bloom_admits(filter: Option<&mut BloomFilter>, key: &[u8]) -> bool {
    match filter {
        None => true,
        Some(filter) => filter.maybe_contains(key) == Membership::MightBePresent,
    }
}

fn import_or_new(path: &Path, capacity: u64, fp_rate: f64) -> StoreResult<BloomFilter> {
    if path.exists() {
        BloomFilter::import(path)
    } else {
        Ok(BloomFilter::with_capacity(capacity, fp_rate))
    }
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
