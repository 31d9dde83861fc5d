use std::fmt;

use crate::error::{DbError, DbResult};
use crate::storage::page::{
    HEADER_SIZE, KV_HEADER_SIZE, NODE_INTERNAL, NODE_LEAF, NODE_TYPE_OFFSET, NUM_KEYS_OFFSET,
    OFFSET_SIZE, PAGE_SIZE, POINTER_SIZE,
};

/// A B-tree node overlaid on a byte buffer it owns.
///
/// Every accessor is range-checked against the declared key count and the
/// buffer length, so a bad index or a corrupted length field comes back as a
/// `DbError` instead of reading or writing past the node.
///
/// Buffers handed to the page store hold exactly `PAGE_SIZE` bytes. Nodes
/// being rebuilt live in a larger scratch buffer (see [`BNode::scratch`]) and
/// are cut down to a page with [`BNode::to_page`] once they are known to fit.
#[derive(Clone, PartialEq, Eq)]
pub struct BNode {
    data: Vec<u8>,
}

impl BNode {
    /// A zeroed buffer of `capacity` bytes (never smaller than the header).
    pub fn with_capacity(capacity: usize) -> Self {
        BNode { data: vec![0; capacity.max(HEADER_SIZE)] }
    }

    /// A zeroed page-sized node.
    pub fn page() -> Self {
        BNode::with_capacity(PAGE_SIZE)
    }

    /// Scratch space for a rebuild: large enough for a full page plus one maximal entry.
    pub fn scratch() -> Self {
        BNode::with_capacity(2 * PAGE_SIZE)
    }

    /// Copy raw page bytes into a node.
    pub fn from_bytes(bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(DbError::Corrupted(format!(
                "buffer of {} bytes is shorter than the node header",
                bytes.len()
            )));
        }
        Ok(BNode { data: bytes.to_vec() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn node_type(&self) -> u16 {
        u16::from_le_bytes([self.data[NODE_TYPE_OFFSET], self.data[NODE_TYPE_OFFSET + 1]])
    }

    pub fn num_keys(&self) -> usize {
        u16::from_le_bytes([self.data[NUM_KEYS_OFFSET], self.data[NUM_KEYS_OFFSET + 1]]) as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type() == NODE_LEAF
    }

    pub fn is_internal(&self) -> bool {
        self.node_type() == NODE_INTERNAL
    }

    /// Write the type tag and key count.
    ///
    /// Fails if the pointer and offset tables for `num_keys` slots would not
    /// fit in the buffer.
    pub fn set_header(&mut self, node_type: u16, num_keys: usize) -> DbResult<()> {
        let nkeys = u16::try_from(num_keys).map_err(|_| DbError::NodeTooLarge {
            size: num_keys,
            capacity: u16::MAX as usize,
        })?;
        let tables_end = kv_region_start(num_keys);
        if tables_end > self.data.len() {
            return Err(DbError::NodeTooLarge { size: tables_end, capacity: self.data.len() });
        }
        self.data[NODE_TYPE_OFFSET..NODE_TYPE_OFFSET + 2].copy_from_slice(&node_type.to_le_bytes());
        self.data[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + 2].copy_from_slice(&nkeys.to_le_bytes());
        Ok(())
    }

    pub fn validate_index(&self, index: usize) -> DbResult<()> {
        let num_keys = self.num_keys();
        if index >= num_keys {
            return Err(DbError::IndexOutOfRange { index, num_keys });
        }
        Ok(())
    }

    pub fn get_ptr(&self, index: usize) -> DbResult<u64> {
        self.validate_index(index)?;
        self.read_u64(HEADER_SIZE + POINTER_SIZE * index)
    }

    pub fn set_ptr(&mut self, index: usize, ptr: u64) -> DbResult<()> {
        self.validate_index(index)?;
        self.write(HEADER_SIZE + POINTER_SIZE * index, &ptr.to_le_bytes())
    }

    /// Position of the stored offset for slot `index`.
    ///
    /// Offsets are stored for slots `1..=num_keys` (the end of every record);
    /// slot 0 always starts at 0 and has no storage, so asking for it is a misuse.
    pub fn offset_pos(&self, index: usize) -> DbResult<usize> {
        let num_keys = self.num_keys();
        if index > num_keys {
            return Err(DbError::IndexOutOfRange { index, num_keys });
        }
        if index == 0 {
            return Err(DbError::Misuse("offset 0 is implicit and never stored"));
        }
        Ok(HEADER_SIZE + POINTER_SIZE * num_keys + OFFSET_SIZE * (index - 1))
    }

    pub fn get_offset(&self, index: usize) -> DbResult<usize> {
        if index == 0 {
            return Ok(0);
        }
        let pos = self.offset_pos(index)?;
        Ok(self.read_u16(pos)? as usize)
    }

    pub fn set_offset(&mut self, index: usize, offset: usize) -> DbResult<()> {
        if index == 0 {
            if offset != 0 {
                return Err(DbError::Misuse("the offset of slot 0 is always 0"));
            }
            return Ok(());
        }
        let pos = self.offset_pos(index)?;
        let offset = u16::try_from(offset).map_err(|_| DbError::NodeTooLarge {
            size: offset,
            capacity: u16::MAX as usize,
        })?;
        self.write(pos, &offset.to_le_bytes())
    }

    /// Absolute position of the record for slot `index`.
    pub fn kv_pos(&self, index: usize) -> DbResult<usize> {
        self.validate_index(index)?;
        Ok(kv_region_start(self.num_keys()) + self.get_offset(index)?)
    }

    pub fn get_key(&self, index: usize) -> DbResult<&[u8]> {
        let pos = self.kv_pos(index)?;
        let (klen, _) = self.kv_lens(pos)?;
        self.slice(pos + KV_HEADER_SIZE, klen)
    }

    pub fn get_val(&self, index: usize) -> DbResult<&[u8]> {
        let pos = self.kv_pos(index)?;
        let (klen, vlen) = self.kv_lens(pos)?;
        self.slice(pos + KV_HEADER_SIZE + klen, vlen)
    }

    /// Number of bytes the node occupies, up to the end of its last record.
    pub fn size(&self) -> DbResult<usize> {
        let num_keys = self.num_keys();
        if num_keys == 0 {
            return Ok(HEADER_SIZE);
        }
        let pos = self.kv_pos(num_keys - 1)?;
        let (klen, vlen) = self.kv_lens(pos)?;
        let end = pos + KV_HEADER_SIZE + klen + vlen;
        if end > self.data.len() {
            return Err(DbError::Corrupted(format!(
                "last record ends at {} in a {}-byte node",
                end,
                self.data.len()
            )));
        }
        Ok(end)
    }

    /// Copy the occupied bytes into a fresh page-sized node.
    pub fn to_page(&self) -> DbResult<BNode> {
        let size = self.size()?;
        if size > PAGE_SIZE {
            return Err(DbError::NodeTooLarge { size, capacity: PAGE_SIZE });
        }
        let mut page = BNode::page();
        page.data[..size].copy_from_slice(&self.data[..size]);
        Ok(page)
    }

    pub(crate) fn write(&mut self, pos: usize, bytes: &[u8]) -> DbResult<()> {
        let capacity = self.data.len();
        let end = pos + bytes.len();
        let dst = self
            .data
            .get_mut(pos..end)
            .ok_or(DbError::NodeTooLarge { size: end, capacity })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn kv_lens(&self, pos: usize) -> DbResult<(usize, usize)> {
        let klen = self.read_u16(pos)? as usize;
        let vlen = self.read_u16(pos + 2)? as usize;
        Ok((klen, vlen))
    }

    fn slice(&self, start: usize, len: usize) -> DbResult<&[u8]> {
        self.data.get(start..start + len).ok_or_else(|| {
            DbError::Corrupted(format!(
                "range {}..{} lies outside a {}-byte node",
                start,
                start + len,
                self.data.len()
            ))
        })
    }

    fn read_u16(&self, pos: usize) -> DbResult<u16> {
        let bytes = self.slice(pos, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u64(&self, pos: usize) -> DbResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.slice(pos, 8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Start of the record region for a node with `num_keys` slots.
pub fn kv_region_start(num_keys: usize) -> usize {
    HEADER_SIZE + (POINTER_SIZE + OFFSET_SIZE) * num_keys
}

impl fmt::Debug for BNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BNode")
            .field("node_type", &self.node_type())
            .field("num_keys", &self.num_keys())
            .field("capacity", &self.data.len())
            .finish()
    }
}
