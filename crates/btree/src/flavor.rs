//! Node flavors. The engine shell in `lib.rs` is generic over this trait and
//! dispatches statically, so alternate page layouts share the traversal,
//! split bookkeeping and root promotion without virtual calls.

use common::PageNo;
use storage::{decode_child, Node, FLAG_DIRTY, NODE_HEADER};

/// Outcome of splitting a full node: both halves as full page images plus the
/// separator key the parent routes on.
pub struct SplitResult {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
    pub separator: Vec<u8>,
}

/// Layout-specific operations of one node flavor.
pub trait NodeFlavor {
    fn search<B: AsRef<[u8]>>(node: &Node<B>, key: &[u8]) -> Result<usize, usize>;

    fn is_full<B: AsRef<[u8]>>(node: &Node<B>, klen: usize, vlen: usize) -> bool;

    /// Child to descend into for a search outcome. On a miss the child is the
    /// entry just below the insertion point.
    fn child_at<B: AsRef<[u8]>>(node: &Node<B>, slot: Result<usize, usize>) -> PageNo;

    /// Split a copy of a full page into two halves around the half-payload
    /// mark.
    fn split(src: &[u8], block_size: usize) -> SplitResult;
}

/// Sorted offset-array layout: binary-searched u16 offsets over
/// length-prefixed records.
pub struct Basic;

impl NodeFlavor for Basic {
    fn search<B: AsRef<[u8]>>(node: &Node<B>, key: &[u8]) -> Result<usize, usize> {
        node.search(key)
    }

    fn is_full<B: AsRef<[u8]>>(node: &Node<B>, klen: usize, vlen: usize) -> bool {
        node.is_full(klen, vlen)
    }

    fn child_at<B: AsRef<[u8]>>(node: &Node<B>, slot: Result<usize, usize>) -> PageNo {
        let pos = match slot {
            Ok(pos) => pos,
            Err(ins) => {
                debug_assert!(ins > 0, "descending below the sentinel entry");
                ins - 1
            }
        };
        decode_child(node.value_at(pos))
    }

    fn split(src: &[u8], block_size: usize) -> SplitResult {
        let view = Node::new(src);
        let filled = view.filled();
        debug_assert!(filled >= 2, "splitting a node with fewer than two entries");
        let kv_last = view.kv_last_pos();
        let leaf = view.is_leaf();
        let half = (block_size - kv_last + 1) / 2;

        let record_len = |pos: usize| {
            let off = view.offset_at(pos);
            let klen = src[off] as usize;
            let vlen = src[off + 1 + klen] as usize;
            klen + vlen + 2
        };

        // First entry that pushes the copied payload past half the used
        // space, capped at the midpoint; `brk` entries stay in the left half.
        let mut brk = filled - 1;
        let mut total = 0;
        for pos in 0..filled {
            total += record_len(pos);
            if total > half || pos == filled / 2 {
                brk = (pos + 1).min(filled - 1);
                break;
            }
        }
        let left_bytes: usize = (0..brk).map(record_len).sum();

        let left_last = view.key_at(brk - 1);
        let right_first = view.key_at(brk);
        let separator = if leaf {
            // shortest prefix of the right half's first key that still sorts
            // above everything on the left
            let mut differ = 0;
            while differ < left_last.len()
                && differ < right_first.len()
                && left_last[differ] == right_first[differ]
            {
                differ += 1;
            }
            debug_assert!(differ < right_first.len());
            right_first[..differ + 1].to_vec()
        } else {
            right_first.to_vec()
        };

        // Left half: records right-aligned against the block end, in order.
        let mut left = vec![0u8; src.len()];
        left[0] = src[0] | FLAG_DIRTY;
        left[5] = src[5];
        let mut write = block_size - left_bytes;
        for pos in 0..brk {
            let off = view.offset_at(pos);
            let rec = record_len(pos);
            left[write..write + rec].copy_from_slice(&src[off..off + rec]);
            left[NODE_HEADER + pos * 2..NODE_HEADER + pos * 2 + 2]
                .copy_from_slice(&(write as u16).to_le_bytes());
            write += rec;
        }
        {
            let mut node = Node::new(&mut left);
            node.set_filled(brk);
            node.set_kv_last_pos(block_size - left_bytes);
        }

        // Right half: records repacked ascending from the old low-water mark,
        // where the copy-through scratch block leaves them.
        let mut right = vec![0u8; src.len()];
        right[0] = src[0] | FLAG_DIRTY;
        right[5] = src[5];
        let mut write = kv_last + left_bytes;
        let right_kv_last = write;
        for pos in brk..filled {
            let off = view.offset_at(pos);
            let rec = record_len(pos);
            right[write..write + rec].copy_from_slice(&src[off..off + rec]);
            let slot = pos - brk;
            right[NODE_HEADER + slot * 2..NODE_HEADER + slot * 2 + 2]
                .copy_from_slice(&(write as u16).to_le_bytes());
            write += rec;
        }
        {
            let mut node = Node::new(&mut right);
            node.set_filled(filled - brk);
            node.set_kv_last_pos(right_kv_last);
        }

        SplitResult {
            left,
            right,
            separator,
        }
    }
}
