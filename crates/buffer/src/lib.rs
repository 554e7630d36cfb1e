//! LRU page cache backing the paged trees.
//!
//! The cache maps logical page numbers onto frames in one contiguous arena:
//! - Frames live in an index-addressable array threaded into a doubly linked
//!   LRU list; a `hashbrown` map resolves `page number -> frame slot`.
//! - Page 0 is the root block: pinned in its own frame, read at open and
//!   written back at close, never evicted.
//! - A page's dirty bit is bit 1 of its first byte, so dirtiness travels with
//!   the page bytes themselves.
//! - Eviction prefers clean frames near the LRU tail; when none is found in a
//!   short walk, a batch of dirty pages is flushed. The batch size adapts to
//!   the observed miss rate.
//!
//! # Example
//!
//! ```no_run
//! use buffer::PageCache;
//! use common::PageNo;
//! use storage::FileIo;
//!
//! let io = FileIo::open("/tmp/pages.db").unwrap();
//! let mut cache = PageCache::open(Box::new(io), 4096, 64).unwrap();
//! let page = cache.allocate(None).unwrap();
//! cache.page(page, None).unwrap()[0] = 0x02; // leaf flags live in byte 0
//! cache.close().unwrap();
//! ```


use common::{CacheStats, PageNo, StoreError, StoreResult};
use hashbrown::HashMap;
use log::{debug, warn};
use std::collections::BTreeSet;
use storage::{BlockIo, FLAG_DIRTY};

const NIL: usize = usize::MAX;
/// Eviction examines at most this many frames for a clean victim before
/// falling back to a batch flush.
const EVICT_SCAN: usize = 10;
/// Floor for the adaptive flush batch target.
const MIN_FLUSH_TARGET: usize = 20;

struct Frame {
    disk_page: u32,
    prev: usize,
    next: usize,
}

/// Fixed-capacity page cache over a `BlockIo` sink.
pub struct PageCache {
    io: Box<dyn BlockIo>,
    page_size: usize,
    capacity: usize,
    arena: Vec<u8>,
    root_block: Vec<u8>,
    frames: Vec<Frame>,
    head: usize,
    tail: usize,
    /// Deepest frame last confirmed clean; eviction starts its walk here.
    last_free: usize,
    map: HashMap<u32, usize>,
    /// Pages appended since the last flush. They have no on-disk image yet.
    new_pages: BTreeSet<u32>,
    file_pages: u32,
    started_empty: bool,
    closed: bool,
    stats: CacheStats,
}

impl PageCache {
    /// Open the backing store, pin page 0 into the root frame and recover the
    /// page count from the store's length. A store too short to hold page 0
    /// is initialized with a zeroed root page.
    pub fn open(mut io: Box<dyn BlockIo>, page_size: usize, capacity_pages: usize) -> StoreResult<Self> {
        assert!(capacity_pages > 0, "capacity_pages must be > 0");
        let mut root_block = vec![0u8; page_size];
        let mut file_pages = (io.len()? / page_size as u64) as u32;
        let n = io.read_at(0, &mut root_block)?;
        let started_empty = n < page_size;
        if started_empty {
            root_block.fill(0);
            file_pages = 1;
            io.write_at(0, &root_block)?;
        }
        let mut cache = Self {
            io,
            page_size,
            capacity: capacity_pages,
            arena: vec![0u8; page_size * capacity_pages],
            root_block,
            frames: Vec::with_capacity(capacity_pages),
            head: NIL,
            tail: NIL,
            last_free: NIL,
            map: HashMap::with_capacity(capacity_pages),
            new_pages: BTreeSet::new(),
            file_pages: file_pages.max(1),
            started_empty,
            closed: false,
            stats: CacheStats::default(),
        };
        if !started_empty {
            cache.stats.pages_read += 1;
        }
        cache.recalc_flush_target();
        Ok(cache)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pages in the backing store, counting unflushed appends.
    pub fn page_count(&self) -> u32 {
        self.file_pages
    }

    /// True when open found no root page on disk.
    pub fn started_empty(&self) -> bool {
        self.started_empty
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn root(&self) -> &[u8] {
        &self.root_block
    }

    pub fn root_mut(&mut self) -> &mut [u8] {
        &mut self.root_block
    }

    /// Return the frame holding `page_no`, faulting it in if necessary.
    /// `keep` names a page the caller is working in; eviction avoids it.
    pub fn page(&mut self, page_no: PageNo, keep: Option<PageNo>) -> StoreResult<&mut [u8]> {
        self.fetch(page_no, keep, false)
    }

    /// Append a page to the store and return its number. The frame is
    /// zero-filled; callers set the flag byte themselves.
    pub fn allocate(&mut self, keep: Option<PageNo>) -> StoreResult<PageNo> {
        if self.new_pages.len() > self.stats.flush_target {
            self.flush_batch(keep)?;
        }
        let page_no = PageNo(self.file_pages);
        self.fetch(page_no, keep, true)?;
        self.new_pages.insert(page_no.0);
        self.file_pages += 1;
        Ok(page_no)
    }

    /// Write back every dirty frame and the root block, then seal the cache.
    /// Safe to call more than once.
    pub fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        let dirty: BTreeSet<u32> = self
            .map
            .iter()
            .filter(|&(_, &slot)| self.slot_dirty(slot))
            .map(|(&page, _)| page)
            .collect();
        self.write_pages(&dirty)?;
        self.io.write_at(0, &self.root_block)?;
        self.stats.pages_written += 1;
        self.closed = true;
        Ok(())
    }

    fn fetch(&mut self, page_no: PageNo, keep: Option<PageNo>, is_new: bool) -> StoreResult<&mut [u8]> {
        if page_no == PageNo::ROOT {
            return Ok(&mut self.root_block);
        }
        if let Some(&slot) = self.map.get(&page_no.0) {
            self.move_to_front(slot);
            if self.frames.len() >= self.capacity {
                self.stats.requests += 1;
            }
            let start = slot * self.page_size;
            return Ok(&mut self.arena[start..start + self.page_size]);
        }
        let slot = if self.frames.len() < self.capacity {
            let slot = self.frames.len();
            self.frames.push(Frame {
                disk_page: page_no.0,
                prev: self.tail,
                next: NIL,
            });
            if self.tail != NIL {
                self.frames[self.tail].next = slot;
            }
            self.tail = slot;
            if self.head == NIL {
                self.head = slot;
            }
            self.map.insert(page_no.0, slot);
            slot
        } else {
            let slot = self.evict_for(page_no, keep)?;
            let old = self.frames[slot].disk_page;
            self.map.remove(&old);
            self.frames[slot].disk_page = page_no.0;
            self.map.insert(page_no.0, slot);
            self.move_to_front(slot);
            self.stats.misses += 1;
            self.stats.requests += 1;
            slot
        };
        let start = slot * self.page_size;
        if is_new || self.new_pages.contains(&page_no.0) {
            // no on-disk image yet; the page is logically zeroed
            self.arena[start..start + self.page_size].fill(0);
        } else {
            let pos = page_no.0 as u64 * self.page_size as u64;
            let n = self.io.read_at(pos, &mut self.arena[start..start + self.page_size])?;
            if n != self.page_size {
                return Err(StoreError::Cache(format!(
                    "short read of page {page_no}: {n} of {} bytes",
                    self.page_size
                )));
            }
            self.stats.pages_read += 1;
        }
        Ok(&mut self.arena[start..start + self.page_size])
    }

    /// Find a clean frame to reuse, flushing batches of dirty pages until one
    /// turns up.
    fn evict_for(&mut self, incoming: PageNo, keep: Option<PageNo>) -> StoreResult<usize> {
        self.recalc_flush_target();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut entry = if self.last_free != NIL { self.last_free } else { self.tail };
            let mut budget = EVICT_SCAN;
            loop {
                let clean = !self.slot_dirty(entry);
                if clean && keep != Some(PageNo(self.frames[entry].disk_page)) {
                    break;
                }
                let prev = self.frames[entry].prev;
                budget -= 1;
                if prev == NIL || budget == 0 {
                    break;
                }
                entry = prev;
            }
            if self.slot_dirty(entry)
                || self.new_pages.len() > self.stats.flush_target
                || self.new_pages.contains(&incoming.0)
            {
                self.flush_batch(keep)?;
            }
            if self.slot_dirty(entry) && attempts > 1 {
                // a lone pinned frame can dodge the batch; write it directly
                self.write_slot(entry)?;
            }
            if !self.slot_dirty(entry) {
                self.last_free = self.frames[entry].prev;
                return Ok(entry);
            }
        }
    }

    /// Flush the pending new pages plus dirty frames collected from the LRU
    /// tail, then reset the walk state.
    fn flush_batch(&mut self, keep: Option<PageNo>) -> StoreResult<()> {
        self.stats.flushes += 1;
        let mut to_write: BTreeSet<u32> = self.new_pages.clone();
        self.recalc_flush_target();
        let mut budget = self.stats.flush_target * 3;
        let mut entry = self.tail;
        while entry != NIL && budget > 0 {
            let page = self.frames[entry].disk_page;
            if keep != Some(PageNo(page)) {
                if self.slot_dirty(entry) {
                    to_write.insert(page);
                }
                if to_write.len() > self.stats.flush_target + self.new_pages.len() {
                    break;
                }
            }
            entry = self.frames[entry].prev;
            budget -= 1;
        }
        self.new_pages.clear();
        debug!(
            "flush batch: {} pages, target {}",
            to_write.len(),
            self.stats.flush_target
        );
        self.write_pages(&to_write)?;
        self.last_free = self.tail;
        Ok(())
    }

    fn write_pages(&mut self, pages: &BTreeSet<u32>) -> StoreResult<()> {
        for &page in pages {
            match self.map.get(&page) {
                Some(&slot) => self.write_slot(slot)?,
                None => {
                    // an appended page that was evicted before its first
                    // write has no frame; its image is still all zeroes
                    let zeroes = vec![0u8; self.page_size];
                    self.io
                        .write_at(page as u64 * self.page_size as u64, &zeroes)?;
                    self.stats.pages_written += 1;
                }
            }
        }
        Ok(())
    }

    fn write_slot(&mut self, slot: usize) -> StoreResult<()> {
        let page = self.frames[slot].disk_page;
        let start = slot * self.page_size;
        self.arena[start] &= !FLAG_DIRTY;
        let pos = page as u64 * self.page_size as u64;
        self.io.write_at(pos, &self.arena[start..start + self.page_size])?;
        self.stats.pages_written += 1;
        self.new_pages.remove(&page);
        Ok(())
    }

    fn slot_dirty(&self, slot: usize) -> bool {
        self.arena[slot * self.page_size] & FLAG_DIRTY != 0
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.last_free == slot {
            self.last_free = self.frames[slot].prev;
        }
        if self.head == slot {
            return;
        }
        if self.tail == slot {
            self.tail = self.frames[slot].prev;
        }
        let (prev, next) = (self.frames[slot].prev, self.frames[slot].next);
        if prev != NIL {
            self.frames[prev].next = next;
        }
        if next != NIL {
            self.frames[next].prev = prev;
        }
        self.frames[slot].prev = NIL;
        self.frames[slot].next = self.head;
        if self.head != NIL {
            self.frames[self.head].prev = slot;
        }
        self.head = slot;
    }

    /// Flush batch target: `capacity * miss_rate`, clamped to
    /// `[capacity/2000, capacity/5]` and floored at `MIN_FLUSH_TARGET`.
    fn recalc_flush_target(&mut self) {
        if self.stats.requests == 0 {
            self.stats.flush_target = MIN_FLUSH_TARGET;
            return;
        }
        let mut target = (self.capacity as u64 * self.stats.misses / self.stats.requests) as usize;
        if target < self.capacity / 2000 {
            target = self.capacity / 2000;
        }
        if target > self.capacity / 5 {
            target = self.capacity / 5;
        }
        if target < MIN_FLUSH_TARGET {
            target = MIN_FLUSH_TARGET;
        }
        self.stats.flush_target = target;
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("page cache write-back on drop failed: {e}");
            }
        }
    }
}
