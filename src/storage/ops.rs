// Copy-on-write node operations.
//
// None of these functions touch the old node: each one writes a complete new
// node into `new`, which must be a separate buffer large enough for the result
// (usually `BNode::scratch`). Records are appended strictly left to right,
// since every append reads the offset the previous append left behind.

use log::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::storage::node::BNode;
use crate::storage::page::{
    check_kv_len, slot_size, HEADER_SIZE, KV_HEADER_SIZE, NODE_INTERNAL, NODE_LEAF, PAGE_SIZE,
};
use crate::storage::pager::PageStore;

/// Index of the rightmost slot whose key is <= `key`.
///
/// Slot 0 is never compared: it holds the separator copied from the parent
/// (or the tree's empty sentinel) and so sorts before any search key. The
/// result is therefore always a valid index for a non-empty node.
pub fn node_lookup_le(node: &BNode, key: &[u8]) -> DbResult<usize> {
    let num_keys = node.num_keys();
    if num_keys == 0 {
        return Err(DbError::IndexOutOfRange { index: 0, num_keys });
    }
    // binary search over 1..num_keys for the first key > `key`
    let (mut lo, mut hi) = (1, num_keys);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if node.get_key(mid)? <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo - 1)
}

/// Exact-match search in a leaf. Returns `None` rather than a nearby slot.
pub fn leaf_lookup(node: &BNode, key: &[u8]) -> DbResult<Option<usize>> {
    let (mut lo, mut hi) = (0, node.num_keys());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match node.get_key(mid)?.cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(Some(mid)),
        }
    }
    Ok(None)
}

/// Write one slot (pointer, record) at `index` and the offset of the slot after it.
pub fn node_append_kv(new: &mut BNode, index: usize, ptr: u64, key: &[u8], val: &[u8]) -> DbResult<()> {
    check_kv_len(key, val)?;
    new.set_ptr(index, ptr)?;

    let pos = new.kv_pos(index)?;
    let end = pos + KV_HEADER_SIZE + key.len() + val.len();
    if end > new.capacity() {
        return Err(DbError::NodeTooLarge { size: end, capacity: new.capacity() });
    }
    // lengths were bounded by check_kv_len, so the narrowing is exact
    new.write(pos, &(key.len() as u16).to_le_bytes())?;
    new.write(pos + 2, &(val.len() as u16).to_le_bytes())?;
    new.write(pos + KV_HEADER_SIZE, key)?;
    new.write(pos + KV_HEADER_SIZE + key.len(), val)?;

    let next = new.get_offset(index)? + KV_HEADER_SIZE + key.len() + val.len();
    new.set_offset(index + 1, next)
}

/// Copy `n` slots from `old[src..src + n]` into `new[dst..dst + n]`.
pub fn node_append_kv_range(new: &mut BNode, old: &BNode, dst: usize, src: usize, n: usize) -> DbResult<()> {
    for i in 0..n {
        let ptr = old.get_ptr(src + i)?;
        let key = old.get_key(src + i)?;
        let val = old.get_val(src + i)?;
        node_append_kv(new, dst + i, ptr, key, val)?;
    }
    Ok(())
}

/// Build a leaf equal to `old` with `key`/`val` inserted at `index`.
pub fn leaf_insert(new: &mut BNode, old: &BNode, index: usize, key: &[u8], val: &[u8]) -> DbResult<()> {
    let num_keys = old.num_keys();
    if index > num_keys {
        return Err(DbError::IndexOutOfRange { index, num_keys });
    }
    check_kv_len(key, val)?;

    new.set_header(NODE_LEAF, num_keys + 1)?;
    node_append_kv_range(new, old, 0, 0, index)?;
    node_append_kv(new, index, 0, key, val)?;
    node_append_kv_range(new, old, index + 1, index, num_keys - index)
}

/// Build a leaf equal to `old` with the pair at `index` replaced.
pub fn leaf_update(new: &mut BNode, old: &BNode, index: usize, key: &[u8], val: &[u8]) -> DbResult<()> {
    old.validate_index(index)?;
    check_kv_len(key, val)?;
    let num_keys = old.num_keys();

    new.set_header(NODE_LEAF, num_keys)?;
    node_append_kv_range(new, old, 0, 0, index)?;
    node_append_kv(new, index, 0, key, val)?;
    node_append_kv_range(new, old, index + 1, index + 1, num_keys - index - 1)
}

/// Build a leaf equal to `old` without the pair at `index`.
pub fn leaf_delete(new: &mut BNode, old: &BNode, index: usize) -> DbResult<()> {
    old.validate_index(index)?;
    let num_keys = old.num_keys();

    new.set_header(NODE_LEAF, num_keys - 1)?;
    node_append_kv_range(new, old, 0, 0, index)?;
    node_append_kv_range(new, old, index, index + 1, num_keys - index - 1)
}

/// Build an internal node equal to `old` with the child at `index` replaced by `kids`.
///
/// Each kid is keyed by its own first key. The kids are committed through
/// `store` only once the whole node has been laid out, and if a commit fails
/// the ones already committed are released again.
pub fn node_replace_kid_n<S: PageStore + ?Sized>(
    store: &mut S,
    new: &mut BNode,
    old: &BNode,
    index: usize,
    kids: &[BNode],
) -> DbResult<()> {
    if kids.is_empty() {
        return Err(DbError::Misuse("a child must be replaced by at least one node"));
    }
    old.validate_index(index)?;
    let num_keys = old.num_keys();
    let inc = kids.len();

    new.set_header(NODE_INTERNAL, num_keys + inc - 1)?;
    node_append_kv_range(new, old, 0, 0, index)?;
    for (i, kid) in kids.iter().enumerate() {
        node_append_kv(new, index + i, 0, kid.get_key(0)?, &[])?;
    }
    node_append_kv_range(new, old, index + inc, index + 1, num_keys - (index + 1))?;

    let mut ptrs = Vec::with_capacity(inc);
    for kid in kids {
        match store.new(kid) {
            Ok(ptr) => ptrs.push(ptr),
            Err(err) => {
                for ptr in ptrs {
                    if let Err(e) = store.del(ptr) {
                        warn!("node_replace_kid_n: could not release page {}: {}", ptr, e);
                    }
                }
                return Err(err);
            }
        }
    }
    for (i, ptr) in ptrs.into_iter().enumerate() {
        new.set_ptr(index + i, ptr)?;
    }
    Ok(())
}

/// Build an internal node equal to `old` with the two children at `index` and
/// `index + 1` replaced by a single pointer.
pub fn node_replace_2kid(new: &mut BNode, old: &BNode, index: usize, ptr: u64, key: &[u8]) -> DbResult<()> {
    old.validate_index(index + 1)?;
    let num_keys = old.num_keys();

    new.set_header(NODE_INTERNAL, num_keys - 1)?;
    node_append_kv_range(new, old, 0, 0, index)?;
    node_append_kv(new, index, ptr, key, &[])?;
    node_append_kv_range(new, old, index + 1, index + 2, num_keys - (index + 2))
}

/// Concatenate two sibling nodes of the same type.
pub fn node_merge(new: &mut BNode, left: &BNode, right: &BNode) -> DbResult<()> {
    let (nleft, nright) = (left.num_keys(), right.num_keys());
    new.set_header(left.node_type(), nleft + nright)?;
    node_append_kv_range(new, left, 0, 0, nleft)?;
    node_append_kv_range(new, right, nleft, 0, nright)
}

/// Cut a possibly oversized node into page-sized siblings, in key order.
///
/// A node that already fits comes back as a single page. Otherwise each
/// sibling takes the longest run of remaining slots that fits in one page.
pub fn node_split(old: &BNode) -> DbResult<Vec<BNode>> {
    if old.size()? <= PAGE_SIZE {
        return Ok(vec![old.to_page()?]);
    }

    let num_keys = old.num_keys();
    let mut parts = Vec::new();
    let mut start = 0;
    while start < num_keys {
        let mut size = HEADER_SIZE;
        let mut count = 0;
        for i in start..num_keys {
            let slot = slot_size(old.get_key(i)?.len(), old.get_val(i)?.len());
            if size + slot > PAGE_SIZE {
                break;
            }
            size += slot;
            count += 1;
        }
        if count == 0 {
            let slot = slot_size(old.get_key(start)?.len(), old.get_val(start)?.len());
            return Err(DbError::NodeTooLarge { size: size + slot, capacity: PAGE_SIZE });
        }

        let mut part = BNode::page();
        part.set_header(old.node_type(), count)?;
        node_append_kv_range(&mut part, old, 0, start, count)?;
        parts.push(part);
        start += count;
    }
    debug!("split node of {} keys into {} pages", num_keys, parts.len());
    Ok(parts)
}
