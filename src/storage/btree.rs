use log::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::storage::node::BNode;
use crate::storage::ops::{
    leaf_delete, leaf_insert, leaf_lookup, leaf_update, node_append_kv, node_lookup_le, node_merge,
    node_replace_2kid, node_replace_kid_n, node_split,
};
use crate::storage::page::{check_kv_len, HEADER_SIZE, MAX_KEY_SIZE, NODE_INTERNAL, NODE_LEAF, PAGE_SIZE};
use crate::storage::pager::PageStore;

/// A copy-on-write B+tree over a page store.
///
/// The tree only remembers its root pointer; every node lives in the store.
/// Updates never modify a page: each level of the descent builds a new node,
/// commits it, and hands the new pointer up to the parent, ending with a new
/// root. Pages the update supersedes are only released after the new root is
/// in place; if any step fails, the pages written so far are released instead
/// and the old root stays valid.
///
///—————————————————————————————————————————————————————————————————————————————————————————————
/// On insert:
///   1. Descend from the root, picking the child with `node_lookup_le`.
///   2. In the leaf, update the matching slot or insert after the LE slot,
///      into a two-page scratch buffer.
///   3. On the way back up, `node_split` cuts each rebuilt child into one or
///      more page-sized siblings, which `node_replace_kid_n` links into the
///      rebuilt parent.
///   4. If the root itself comes back as several pages, a new internal root
///      is grown on top of them.
///
/// On delete:
///   1. Descend the same way; a missing key leaves the tree untouched.
///   2. A rebuilt child at or below a quarter page is merged with its left
///      sibling when the result fits, else with its right sibling.
///   3. An internal root left with one child is replaced by that child.
///—————————————————————————————————————————————————————————————————————————————————————————————
///
/// The first slot of the leftmost leaf holds an empty sentinel key, so every
/// search key compares >= slot 0 at every level. For that reason the empty
/// key itself cannot be stored.
pub struct BTree<S: PageStore> {
    /// Pointer to the root page, or 0 for an empty tree.
    root: u64,
    store: S,

    /// Pages committed by the update in progress.
    written: Vec<u64>,

    /// Pages the update in progress replaces; freed once the new root is set.
    superseded: Vec<u64>,
}

/// Passes page operations through to the store, remembering the pages it commits.
struct Recorder<'a, S: PageStore> {
    store: &'a mut S,
    written: &'a mut Vec<u64>,
}

impl<S: PageStore> PageStore for Recorder<'_, S> {
    fn get(&mut self, ptr: u64) -> DbResult<BNode> {
        self.store.get(ptr)
    }

    fn new(&mut self, node: &BNode) -> DbResult<u64> {
        let ptr = self.store.new(node)?;
        self.written.push(ptr);
        Ok(ptr)
    }

    fn del(&mut self, ptr: u64) -> DbResult<()> {
        self.written.retain(|&p| p != ptr);
        self.store.del(ptr)
    }
}

enum MergeWith {
    Left(u64, BNode),
    Right(u64, BNode),
}

impl<S: PageStore> BTree<S> {
    /// An empty tree on top of `store`.
    pub fn new(store: S) -> Self {
        BTree::open(store, 0)
    }

    /// Reattach to a tree whose root pointer was kept by the caller.
    pub fn open(store: S, root: u64) -> Self {
        BTree { root, store, written: Vec::new(), superseded: Vec::new() }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Point lookup: returns a copy of the value stored under `key`.
    pub fn get(&mut self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        check_key(key)?;
        if self.root == 0 {
            return Ok(None);
        }

        let mut page_num = self.root;
        loop {
            let node = self.store.get(page_num)?;
            match node.node_type() {
                NODE_LEAF => {
                    return match leaf_lookup(&node, key)? {
                        Some(idx) => Ok(Some(node.get_val(idx)?.to_vec())),
                        None => Ok(None),
                    };
                }
                NODE_INTERNAL => {
                    let idx = node_lookup_le(&node, key)?;
                    page_num = node.get_ptr(idx)?;
                }
                other => return Err(bad_node_type(page_num, other)),
            }
        }
    }

    /// Insert `key`, or replace its value if it is already present.
    pub fn insert(&mut self, key: &[u8], val: &[u8]) -> DbResult<()> {
        check_key(key)?;
        check_kv_len(key, val)?;
        let outcome = self.root_insert(key, val);
        self.finish(outcome)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> DbResult<bool> {
        check_key(key)?;
        if self.root == 0 {
            return Ok(false);
        }

        let current = self.root;
        let outcome = self.root_delete(key);
        let found = matches!(outcome, Ok(Some(_)));
        self.finish(outcome.map(|root| root.unwrap_or(current)))?;
        Ok(found)
    }

    /// All pairs in key order, without the sentinel.
    pub fn scan(&mut self) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        if self.root != 0 {
            self.collect(self.root, &mut out)?;
        }
        Ok(out)
    }

    /// Number of levels from the root down to the leaves (0 for an empty tree).
    pub fn height(&mut self) -> DbResult<usize> {
        let mut height = 0;
        let mut page_num = self.root;
        while page_num != 0 {
            height += 1;
            let node = self.store.get(page_num)?;
            page_num = if node.is_internal() { node.get_ptr(0)? } else { 0 };
        }
        Ok(height)
    }

    fn collect(&mut self, page_num: u64, out: &mut Vec<(Vec<u8>, Vec<u8>)>) -> DbResult<()> {
        let node = self.store.get(page_num)?;
        match node.node_type() {
            NODE_LEAF => {
                for i in 0..node.num_keys() {
                    let key = node.get_key(i)?;
                    if !key.is_empty() {
                        out.push((key.to_vec(), node.get_val(i)?.to_vec()));
                    }
                }
                Ok(())
            }
            NODE_INTERNAL => {
                for i in 0..node.num_keys() {
                    self.collect(node.get_ptr(i)?, out)?;
                }
                Ok(())
            }
            other => Err(bad_node_type(page_num, other)),
        }
    }

    /// Build the new tree for an insert and return its root pointer.
    fn root_insert(&mut self, key: &[u8], val: &[u8]) -> DbResult<u64> {
        if self.root == 0 {
            let mut root = BNode::page();
            root.set_header(NODE_LEAF, 2)?;
            node_append_kv(&mut root, 0, 0, &[], &[])?;
            node_append_kv(&mut root, 1, 0, key, val)?;
            let ptr = self.commit(&root)?;
            info!("created root leaf {}", ptr);
            return Ok(ptr);
        }

        let old_root = self.root;
        let node = self.store.get(old_root)?;
        let updated = self.tree_insert(old_root, &node, key, val)?;
        let root = self.install_root(node_split(&updated)?)?;
        self.superseded.push(old_root);
        Ok(root)
    }

    /// Build the new tree for a delete. `None` if the key is absent.
    fn root_delete(&mut self, key: &[u8]) -> DbResult<Option<u64>> {
        let old_root = self.root;
        let node = self.store.get(old_root)?;
        let Some(updated) = self.tree_delete(old_root, &node, key)? else {
            return Ok(None);
        };
        self.superseded.push(old_root);

        let root = if updated.num_keys() == 0 {
            info!("tree is empty, dropping root {}", old_root);
            0
        } else if updated.is_internal() && updated.num_keys() == 1 {
            let root = self.collapse_root(updated.get_ptr(0)?)?;
            info!("collapsed root {} onto {}", old_root, root);
            root
        } else {
            self.install_root(node_split(&updated)?)?
        };
        Ok(Some(root))
    }

    /// Switch to the new root and release what it replaced, or on failure
    /// release what the update wrote and keep the old root.
    fn finish(&mut self, outcome: DbResult<u64>) -> DbResult<()> {
        let written = std::mem::take(&mut self.written);
        let superseded = std::mem::take(&mut self.superseded);
        match outcome {
            Ok(root) => {
                self.root = root;
                for ptr in superseded {
                    self.store.del(ptr)?;
                }
                Ok(())
            }
            Err(err) => {
                debug!("update failed, releasing {} new pages", written.len());
                for ptr in written {
                    if let Err(e) = self.store.del(ptr) {
                        warn!("could not release page {}: {}", ptr, e);
                    }
                }
                Err(err)
            }
        }
    }

    fn commit(&mut self, node: &BNode) -> DbResult<u64> {
        let ptr = self.store.new(node)?;
        self.written.push(ptr);
        Ok(ptr)
    }

    fn recorder(&mut self) -> Recorder<'_, S> {
        Recorder { store: &mut self.store, written: &mut self.written }
    }

    /// Commit the split results of the old root, growing a level if needed.
    fn install_root(&mut self, parts: Vec<BNode>) -> DbResult<u64> {
        if parts.len() == 1 {
            return self.commit(&parts[0]);
        }

        let mut root = BNode::page();
        root.set_header(NODE_INTERNAL, parts.len())?;
        for (i, kid) in parts.iter().enumerate() {
            let ptr = self.commit(kid)?;
            node_append_kv(&mut root, i, ptr, kid.get_key(0)?, &[])?;
        }
        let ptr = self.commit(&root)?;
        info!("root split into {} pages, new root is {}", parts.len(), ptr);
        Ok(ptr)
    }

    /// Skip down past internal nodes that have a single child.
    fn collapse_root(&mut self, mut page_num: u64) -> DbResult<u64> {
        loop {
            let node = self.store.get(page_num)?;
            if !node.is_internal() || node.num_keys() != 1 {
                return Ok(page_num);
            }
            let child = node.get_ptr(0)?;
            debug!("collapse_root: {} has a single child {}", page_num, child);
            self.superseded.push(page_num);
            page_num = child;
        }
    }

    /// Insert into the subtree rooted at `node`. The result may exceed a page.
    fn tree_insert(&mut self, page_num: u64, node: &BNode, key: &[u8], val: &[u8]) -> DbResult<BNode> {
        let mut new = BNode::scratch();
        let idx = node_lookup_le(node, key)?;
        match node.node_type() {
            NODE_LEAF => {
                if node.get_key(idx)? == key {
                    debug!("tree_insert: updating slot {} of leaf {}", idx, page_num);
                    leaf_update(&mut new, node, idx, key, val)?;
                } else {
                    debug!("tree_insert: inserting at slot {} of leaf {}", idx + 1, page_num);
                    leaf_insert(&mut new, node, idx + 1, key, val)?;
                }
            }
            NODE_INTERNAL => {
                let kid_ptr = node.get_ptr(idx)?;
                debug!("tree_insert: descending from {} into child {}", page_num, kid_ptr);
                let kid = self.store.get(kid_ptr)?;
                let updated = self.tree_insert(kid_ptr, &kid, key, val)?;
                let parts = node_split(&updated)?;
                node_replace_kid_n(&mut self.recorder(), &mut new, node, idx, &parts)?;
                self.superseded.push(kid_ptr);
            }
            other => return Err(bad_node_type(page_num, other)),
        }
        Ok(new)
    }

    /// Delete from the subtree rooted at `node`. `None` if the key is absent.
    fn tree_delete(&mut self, page_num: u64, node: &BNode, key: &[u8]) -> DbResult<Option<BNode>> {
        let idx = node_lookup_le(node, key)?;
        match node.node_type() {
            NODE_LEAF => {
                if node.get_key(idx)? != key {
                    return Ok(None);
                }
                debug!("tree_delete: removing slot {} of leaf {}", idx, page_num);
                let mut new = BNode::scratch();
                leaf_delete(&mut new, node, idx)?;
                Ok(Some(new))
            }
            NODE_INTERNAL => self.node_delete(node, idx, key),
            other => Err(bad_node_type(page_num, other)),
        }
    }

    fn node_delete(&mut self, node: &BNode, idx: usize, key: &[u8]) -> DbResult<Option<BNode>> {
        let kid_ptr = node.get_ptr(idx)?;
        let kid = self.store.get(kid_ptr)?;
        let Some(updated) = self.tree_delete(kid_ptr, &kid, key)? else {
            return Ok(None);
        };

        let mut new = BNode::scratch();
        match self.should_merge(node, idx, &updated)? {
            Some(MergeWith::Left(sibling_ptr, sibling)) => {
                debug!("node_delete: merging child {} into left sibling {}", kid_ptr, sibling_ptr);
                let mut merged = BNode::scratch();
                node_merge(&mut merged, &sibling, &updated)?;
                let ptr = self.commit(&merged)?;
                node_replace_2kid(&mut new, node, idx - 1, ptr, merged.get_key(0)?)?;
                self.superseded.push(sibling_ptr);
            }
            Some(MergeWith::Right(sibling_ptr, sibling)) => {
                debug!("node_delete: merging right sibling {} into child {}", sibling_ptr, kid_ptr);
                let mut merged = BNode::scratch();
                node_merge(&mut merged, &updated, &sibling)?;
                let ptr = self.commit(&merged)?;
                node_replace_2kid(&mut new, node, idx, ptr, merged.get_key(0)?)?;
                self.superseded.push(sibling_ptr);
            }
            None if updated.num_keys() == 0 => {
                // only child emptied out; the parent becomes empty and its own parent merges it away
                debug!("node_delete: child {} emptied with no sibling", kid_ptr);
                new.set_header(NODE_INTERNAL, 0)?;
            }
            None => {
                let parts = node_split(&updated)?;
                node_replace_kid_n(&mut self.recorder(), &mut new, node, idx, &parts)?;
            }
        }
        self.superseded.push(kid_ptr);
        Ok(Some(new))
    }

    fn should_merge(&mut self, node: &BNode, idx: usize, updated: &BNode) -> DbResult<Option<MergeWith>> {
        let size = updated.size()?;
        if size > PAGE_SIZE / 4 {
            return Ok(None);
        }

        if idx > 0 {
            let ptr = node.get_ptr(idx - 1)?;
            let sibling = self.store.get(ptr)?;
            if sibling.size()? + size - HEADER_SIZE <= PAGE_SIZE {
                return Ok(Some(MergeWith::Left(ptr, sibling)));
            }
        }
        if idx + 1 < node.num_keys() {
            let ptr = node.get_ptr(idx + 1)?;
            let sibling = self.store.get(ptr)?;
            if sibling.size()? + size - HEADER_SIZE <= PAGE_SIZE {
                return Ok(Some(MergeWith::Right(ptr, sibling)));
            }
        }
        Ok(None)
    }
}

fn check_key(key: &[u8]) -> DbResult<()> {
    if key.is_empty() {
        return Err(DbError::EmptyKey);
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(DbError::KeyTooLarge(key.len()));
    }
    Ok(())
}

fn bad_node_type(page_num: u64, node_type: u16) -> DbError {
    DbError::Corrupted(format!("page {} has unknown node type {}", page_num, node_type))
}
