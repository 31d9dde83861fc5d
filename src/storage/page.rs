// ┌──────────────────────────────────────────────────────────────────────────┐
// │ Offset    │ Length │ Description                                         │
// │───────────┼────────┼─────────────────────────────────────────────────────│
// │   0       │   2    │ NODE_TYPE (0 = internal, 1 = leaf)                  │
// │   2       │   2    │ NKEYS (u16): number of slots in this node           │
// │   4       │  8·N   │ POINTERS (u64): child page numbers (leaf: unused)   │
// │   4+8N    │  2·N   │ OFFSETS (u16): end of record i, for i in 1..=N      │
// │   4+10N   │  ...   │ RECORDS: [klen u16][vlen u16][key][val] ...         │
// └──────────────────────────────────────────────────────────────────────────┘
//
// All integers are little-endian. Offsets are relative to the start of the
// record region; the offset of record 0 is always 0 and is not stored.

use crate::error::{DbError, DbResult};

pub const PAGE_SIZE: usize = 4096;

pub const NODE_TYPE_OFFSET: usize = 0;   // 2 bytes (u16)
pub const NUM_KEYS_OFFSET: usize = 2;    // 2 bytes (u16)
pub const HEADER_SIZE: usize = 4;        // total header length

pub const POINTER_SIZE: usize = 8;
pub const OFFSET_SIZE: usize = 2;
pub const KV_HEADER_SIZE: usize = 4;     // klen + vlen

pub const MAX_KEY_SIZE: usize = 1000;
pub const MAX_VAL_SIZE: usize = 3000;

pub const NODE_INTERNAL: u16 = 0;
pub const NODE_LEAF: u16 = 1;

/// Bytes a single slot costs outside the header: pointer, offset, record header and payload.
pub fn slot_size(klen: usize, vlen: usize) -> usize {
    POINTER_SIZE + OFFSET_SIZE + KV_HEADER_SIZE + klen + vlen
}

/// Size of a node holding exactly one maximal entry.
pub fn max_single_entry_node() -> usize {
    HEADER_SIZE + slot_size(MAX_KEY_SIZE, MAX_VAL_SIZE)
}

/// Structural sanity check, run once before any node is touched.
///
/// A node with a single key of `MAX_KEY_SIZE` and a value of `MAX_VAL_SIZE`
/// must fit in one page, otherwise splitting can never make progress.
pub fn check_layout() -> DbResult<()> {
    check_layout_with(max_single_entry_node(), PAGE_SIZE)
}

fn check_layout_with(required: usize, page_size: usize) -> DbResult<()> {
    if required > page_size {
        return Err(DbError::InvalidLayout { required, page_size });
    }
    Ok(())
}

/// Reject keys and values longer than the format allows, before anything is written.
pub fn check_kv_len(key: &[u8], val: &[u8]) -> DbResult<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(DbError::KeyTooLarge(key.len()));
    }
    if val.len() > MAX_VAL_SIZE {
        return Err(DbError::ValueTooLarge(val.len()));
    }
    Ok(())
}
