//! Paged B+tree engine over the LRU page cache.
//!
//! Keys and values are byte strings of at most 255 bytes. The tree never
//! overwrites on insert: a duplicate `put` returns the stored value and
//! leaves the record alone, so replace is delete-then-insert by the caller.
//! Page 0 is always the root; growing the tree copies the old root out to a
//! fresh page and re-initializes page 0 as an internal node, so the root
//! frame pinned by the cache stays authoritative.


mod flavor;
pub use flavor::{Basic, NodeFlavor, SplitResult};

use buffer::PageCache;
use common::{CacheStats, PageNo, StoreError, StoreResult, MAX_KEY_LEN, MAX_VALUE_LEN};
use std::marker::PhantomData;
use std::path::Path;
use storage::{encode_child, BlockIo, FileIo, Node};

/// Deepest tree the traversal path stack can record.
const MAX_DEPTH: usize = 9;

/// A B+tree of one node flavor over one cache-backed file.
pub struct BpTree<F = Basic> {
    cache: PageCache,
    leaf_block_size: usize,
    parent_block_size: usize,
    entry_count: u64,
    levels: u8,
    max_key_len: usize,
    leaf_splits: u64,
    node_splits: u64,
    _flavor: PhantomData<F>,
}

impl<F: NodeFlavor> BpTree<F> {
    /// Open or create a tree file. A fresh file gets an empty leaf root.
    pub fn open(
        path: &Path,
        leaf_block_size: usize,
        parent_block_size: usize,
        cache_pages: usize,
    ) -> StoreResult<Self> {
        let io = FileIo::open(path)?;
        Self::with_io(Box::new(io), leaf_block_size, parent_block_size, cache_pages)
    }

    /// Same as `open` over any block sink; tests run this against memory.
    pub fn with_io(
        io: Box<dyn BlockIo>,
        leaf_block_size: usize,
        parent_block_size: usize,
        cache_pages: usize,
    ) -> StoreResult<Self> {
        assert!(parent_block_size <= leaf_block_size);
        // kv_last_pos and record offsets are u16
        assert!(leaf_block_size <= u16::MAX as usize);
        let mut cache = PageCache::open(io, leaf_block_size, cache_pages)?;
        if cache.started_empty() {
            let mut root = Node::new(cache.root_mut());
            root.init(true, leaf_block_size);
        }
        Ok(Self {
            cache,
            leaf_block_size,
            parent_block_size,
            entry_count: 0,
            levels: 1,
            max_key_len: 0,
            leaf_splits: 0,
            node_splits: 0,
            _flavor: PhantomData,
        })
    }

    pub fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::KeyTooLarge(key.len()));
        }
        let (leaf, slot) = self.locate(key)?;
        match slot {
            Ok(pos) => Ok(Some(self.leaf_value(leaf, pos)?)),
            Err(_) => Ok(None),
        }
    }

    /// Insert without overwrite. Returns the stored value when the key is
    /// already present.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::KeyTooLarge(key.len()));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(StoreError::ValueTooLarge(value.len(), MAX_VALUE_LEN));
        }
        if self.max_key_len < key.len() {
            self.max_key_len = key.len();
        }
        {
            let root = self.cache.page(PageNo::ROOT, None)?;
            let mut node = Node::new(root);
            if node.is_leaf() && node.filled() == 0 {
                node.insert_record(0, key, value);
                node.set_dirty();
                self.entry_count += 1;
                return Ok(None);
            }
        }
        let (path, leaf, slot) = self.traverse(key)?;
        if let Ok(pos) = slot {
            return Ok(Some(self.leaf_value(leaf, pos)?));
        }
        self.insert_upward(path, leaf, slot, key, value)?;
        self.entry_count += 1;
        Ok(None)
    }

    /// Leaf page that owns `key`, plus the search outcome within it.
    pub fn locate(&mut self, key: &[u8]) -> StoreResult<(PageNo, Result<usize, usize>)> {
        let (_, leaf, slot) = self.traverse(key)?;
        Ok((leaf, slot))
    }

    pub fn leaf_len(&mut self, leaf: PageNo) -> StoreResult<usize> {
        let buf = self.cache.page(leaf, None)?;
        Ok(Node::new(buf).filled())
    }

    pub fn leaf_entry(&mut self, leaf: PageNo, pos: usize) -> StoreResult<(Vec<u8>, Vec<u8>)> {
        let buf = self.cache.page(leaf, None)?;
        let node = Node::new(buf);
        Ok((node.key_at(pos).to_vec(), node.value_at(pos).to_vec()))
    }

    pub fn leaf_value(&mut self, leaf: PageNo, pos: usize) -> StoreResult<Vec<u8>> {
        let buf = self.cache.page(leaf, None)?;
        Ok(Node::new(buf).value_at(pos).to_vec())
    }

    /// Mutate a stored value in place, without moving the record.
    pub fn leaf_value_mut<R>(
        &mut self,
        leaf: PageNo,
        pos: usize,
        mutate: impl FnOnce(&mut [u8]) -> R,
    ) -> StoreResult<R> {
        let buf = self.cache.page(leaf, None)?;
        let mut node = Node::new(buf);
        let out = mutate(node.value_at_mut(pos));
        node.set_dirty();
        Ok(out)
    }

    pub fn leaf_remove(&mut self, leaf: PageNo, pos: usize) -> StoreResult<()> {
        let buf = self.cache.page(leaf, None)?;
        let mut node = Node::new(buf);
        node.remove_entry(pos);
        node.set_dirty();
        Ok(())
    }

    /// Repack a leaf's records, reclaiming space left by removals.
    pub fn leaf_compact(&mut self, leaf: PageNo) -> StoreResult<()> {
        let block = self.leaf_block_size;
        let buf = self.cache.page(leaf, None)?;
        let mut node = Node::new(buf);
        node.compact(block);
        node.set_dirty();
        Ok(())
    }

    /// Would inserting a record of this shape overflow the leaf?
    pub fn leaf_would_overflow(
        &mut self,
        leaf: PageNo,
        klen: usize,
        vlen: usize,
    ) -> StoreResult<bool> {
        let buf = self.cache.page(leaf, None)?;
        let node = Node::new(buf);
        Ok(F::is_full(&node, klen, vlen))
    }

    /// Entries inserted since open.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn levels(&self) -> u8 {
        self.levels
    }

    pub fn max_key_len(&self) -> usize {
        self.max_key_len
    }

    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits
    }

    pub fn node_splits(&self) -> u64 {
        self.node_splits
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_page_count(&self) -> u32 {
        self.cache.page_count()
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Flush dirty pages and the root block. The tree stays usable.
    pub fn close(&mut self) -> StoreResult<()> {
        self.cache.close()
    }

    fn traverse(
        &mut self,
        key: &[u8],
    ) -> StoreResult<(Vec<PageNo>, PageNo, Result<usize, usize>)> {
        let mut path: Vec<PageNo> = Vec::with_capacity(MAX_DEPTH);
        let mut page = PageNo::ROOT;
        loop {
            let (is_leaf, slot, child) = {
                let buf = self.cache.page(page, None)?;
                let node = Node::new(buf);
                let slot = F::search(&node, key);
                if node.is_leaf() {
                    (true, slot, PageNo::ROOT)
                } else {
                    (false, slot, F::child_at(&node, slot))
                }
            };
            if is_leaf {
                let height = path.len() as u8 + 1;
                if self.levels < height {
                    self.levels = height;
                }
                return Ok((path, page, slot));
            }
            debug_assert!(path.len() < MAX_DEPTH);
            path.push(page);
            page = child;
        }
    }

    /// Insert at the leaf and bubble separators upward, splitting full nodes
    /// on the way.
    fn insert_upward(
        &mut self,
        path: Vec<PageNo>,
        mut page: PageNo,
        mut slot: Result<usize, usize>,
        key: &[u8],
        value: &[u8],
    ) -> StoreResult<()> {
        let mut pending_key = key.to_vec();
        let mut pending_value = value.to_vec();
        let mut level = path.len();
        loop {
            let pos = match slot {
                // an equal separator already routes correctly; nothing to add
                Ok(_) => return Ok(()),
                Err(pos) => pos,
            };
            let inserted = {
                let buf = self.cache.page(page, None)?;
                let mut node = Node::new(buf);
                if F::is_full(&node, pending_key.len(), pending_value.len()) {
                    false
                } else {
                    node.insert_record(pos, &pending_key, &pending_value);
                    node.set_dirty();
                    true
                }
            };
            if inserted {
                return Ok(());
            }
            let (separator, new_page) = self.split_page(page)?;
            let target = if separator.as_slice() <= pending_key.as_slice() {
                new_page
            } else {
                page
            };
            {
                let buf = self.cache.page(target, None)?;
                let mut node = Node::new(buf);
                if let Err(pos) = F::search(&node, &pending_key) {
                    node.insert_record(pos, &pending_key, &pending_value);
                }
                node.set_dirty();
            }
            if page == PageNo::ROOT {
                return self.promote_root(&separator, new_page);
            }
            level -= 1;
            let parent = path[level];
            pending_key = separator;
            pending_value = encode_child(new_page);
            slot = {
                let buf = self.cache.page(parent, None)?;
                let node = Node::new(buf);
                F::search(&node, &pending_key)
            };
            page = parent;
        }
    }

    fn split_page(&mut self, page: PageNo) -> StoreResult<(Vec<u8>, PageNo)> {
        let (src, is_leaf) = {
            let buf = self.cache.page(page, None)?;
            (buf.to_vec(), buf[0] & storage::FLAG_LEAF != 0)
        };
        let block_size = if is_leaf {
            self.leaf_block_size
        } else {
            self.parent_block_size
        };
        let halves = F::split(&src, block_size);
        let new_page = self.cache.allocate(Some(page))?;
        self.cache
            .page(page, Some(new_page))?
            .copy_from_slice(&halves.left);
        self.cache
            .page(new_page, Some(page))?
            .copy_from_slice(&halves.right);
        if is_leaf {
            self.leaf_splits += 1;
        } else {
            self.node_splits += 1;
        }
        Ok((halves.separator, new_page))
    }

    /// Copy the root's content out to a fresh page and rebuild page 0 as an
    /// internal node over both halves. The sentinel empty key keeps every
    /// search routable.
    fn promote_root(&mut self, separator: &[u8], new_page: PageNo) -> StoreResult<()> {
        let moved = self.cache.allocate(Some(new_page))?;
        let root_copy = self.cache.root().to_vec();
        {
            let buf = self.cache.page(moved, None)?;
            buf.copy_from_slice(&root_copy);
            let mut node = Node::new(buf);
            node.set_dirty();
        }
        {
            let mut node = Node::new(self.cache.root_mut());
            node.init(false, self.parent_block_size);
            node.insert_record(0, b"", &encode_child(moved));
            let pos = match F::search(&node, separator) {
                Ok(pos) | Err(pos) => pos,
            };
            node.insert_record(pos, separator, &encode_child(new_page));
        }
        self.levels += 1;
        Ok(())
    }
}
