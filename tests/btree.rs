use std::collections::BTreeMap;
use std::io;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simplekv::storage::page::{MAX_KEY_SIZE, MAX_VAL_SIZE};
use simplekv::{BNode, BTree, DbError, DbResult, MemoryPages, PageStore};

fn key(i: usize) -> Vec<u8> {
    format!("key{:06}", i).into_bytes()
}

/// Memory pages that refuse to commit once `commits_left` runs out.
struct FullDisk {
    pages: MemoryPages,
    commits_left: Option<usize>,
}

impl PageStore for FullDisk {
    fn get(&mut self, ptr: u64) -> DbResult<BNode> {
        self.pages.get(ptr)
    }

    fn new(&mut self, node: &BNode) -> DbResult<u64> {
        match &mut self.commits_left {
            Some(0) => Err(DbError::Io(io::Error::new(io::ErrorKind::Other, "disk full"))),
            Some(n) => {
                *n -= 1;
                self.pages.new(node)
            }
            None => self.pages.new(node),
        }
    }

    fn del(&mut self, ptr: u64) -> DbResult<()> {
        self.pages.del(ptr)
    }
}

fn full_disk_tree(count: usize) -> BTree<FullDisk> {
    let mut tree = BTree::new(FullDisk { pages: MemoryPages::new(), commits_left: None });
    let val = vec![b'v'; 100];
    for i in 0..count {
        tree.insert(&key(i), &val).unwrap();
    }
    tree
}

fn assert_unchanged(tree: &mut BTree<FullDisk>, root: u64, live: usize, count: usize) {
    assert_eq!(tree.root(), root);
    assert_eq!(tree.store().pages.live_pages(), live);
    for i in 0..count {
        assert_eq!(tree.get(&key(i)).unwrap(), Some(vec![b'v'; 100]), "key {}", i);
    }
}

#[test]
fn empty_tree() {
    let mut tree = BTree::new(MemoryPages::new());
    assert_eq!(tree.root(), 0);
    assert_eq!(tree.get(b"missing").unwrap(), None);
    assert!(!tree.delete(b"missing").unwrap());
    assert_eq!(tree.height().unwrap(), 0);
    assert!(tree.scan().unwrap().is_empty());
}

#[test]
fn insert_get_and_overwrite() {
    let mut tree = BTree::new(MemoryPages::new());
    tree.insert(b"b", b"2").unwrap();
    tree.insert(b"a", b"1").unwrap();
    tree.insert(b"c", b"3").unwrap();

    assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(tree.get(b"c").unwrap(), Some(b"3".to_vec()));
    assert_eq!(tree.get(b"d").unwrap(), None);

    tree.insert(b"b", b"two").unwrap();
    assert_eq!(tree.get(b"b").unwrap(), Some(b"two".to_vec()));

    let pairs = tree.scan().unwrap();
    let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
}

#[test]
fn updates_are_copy_on_write() {
    let mut tree = BTree::new(MemoryPages::new());
    tree.insert(b"a", b"1").unwrap();
    let first_root = tree.root();
    tree.insert(b"b", b"2").unwrap();
    assert_ne!(tree.root(), first_root);
    // the superseded root went back to the store
    assert_eq!(tree.store().live_pages(), 1);
    assert_eq!(tree.store().freed_pages(), 1);
}

#[test]
fn bad_keys_and_values_leave_the_tree_alone() {
    let mut tree = BTree::new(MemoryPages::new());
    assert!(matches!(tree.insert(b"", b"x"), Err(DbError::EmptyKey)));
    assert!(matches!(tree.get(b""), Err(DbError::EmptyKey)));

    let long_key = vec![b'k'; MAX_KEY_SIZE + 1];
    assert!(matches!(tree.insert(&long_key, b"x"), Err(DbError::KeyTooLarge(_))));
    let long_val = vec![b'v'; MAX_VAL_SIZE + 1];
    assert!(matches!(tree.insert(b"k", &long_val), Err(DbError::ValueTooLarge(_))));
    assert_eq!(tree.root(), 0);

    let max_key = vec![b'k'; MAX_KEY_SIZE];
    let max_val = vec![b'v'; MAX_VAL_SIZE];
    tree.insert(&max_key, &max_val).unwrap();
    assert_eq!(tree.get(&max_key).unwrap(), Some(max_val));
}

#[test]
fn many_inserts_grow_the_tree() {
    let mut tree = BTree::new(MemoryPages::new());
    let val = vec![b'x'; 100];
    for i in (0..3000).rev() {
        tree.insert(&key(i), &val).unwrap();
    }
    assert!(tree.height().unwrap() >= 2);

    for i in 0..3000 {
        assert_eq!(tree.get(&key(i)).unwrap().as_deref(), Some(val.as_slice()), "key {}", i);
    }
    let pairs = tree.scan().unwrap();
    assert_eq!(pairs.len(), 3000);
    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn large_records_split_into_single_entry_pages() {
    let mut tree = BTree::new(MemoryPages::new());
    for i in 0..40 {
        let k = vec![b'a' + (i % 26) as u8; 1 + i * 20];
        let v = vec![i as u8; MAX_VAL_SIZE];
        tree.insert(&k, &v).unwrap();
    }
    for i in 0..40 {
        let k = vec![b'a' + (i % 26) as u8; 1 + i * 20];
        assert_eq!(tree.get(&k).unwrap(), Some(vec![i as u8; MAX_VAL_SIZE]));
    }
    assert!(tree.height().unwrap() >= 2);
}

#[test]
fn deleting_everything_shrinks_back_to_one_page() {
    let mut tree = BTree::new(MemoryPages::new());
    let val = vec![b'y'; 200];
    for i in 0..2000 {
        tree.insert(&key(i), &val).unwrap();
    }
    assert!(tree.height().unwrap() >= 2);

    for i in (0..2000).step_by(2) {
        assert!(tree.delete(&key(i)).unwrap());
    }
    assert!(!tree.delete(&key(0)).unwrap());
    for i in 0..2000 {
        let expected = if i % 2 == 0 { None } else { Some(val.clone()) };
        assert_eq!(tree.get(&key(i)).unwrap(), expected, "key {}", i);
    }

    for i in (1..2000).step_by(2) {
        assert!(tree.delete(&key(i)).unwrap());
    }
    assert!(tree.scan().unwrap().is_empty());
    assert_eq!(tree.height().unwrap(), 1);
    assert_eq!(tree.store().live_pages(), 1);

    tree.insert(b"again", b"1").unwrap();
    assert_eq!(tree.get(b"again").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn failed_insert_keeps_the_old_tree_readable() {
    let mut tree = full_disk_tree(500);
    assert!(tree.height().unwrap() >= 2);
    let root = tree.root();
    let live = tree.store().pages.live_pages();

    // at least a new leaf and a new root are needed, so small budgets fail at every level
    for budget in 0..2 {
        tree.store_mut().commits_left = Some(budget);
        let err = tree.insert(b"key000250x", b"v").unwrap_err();
        assert!(matches!(err, DbError::Io(_)));
        tree.store_mut().commits_left = None;
        assert_unchanged(&mut tree, root, live, 500);
        assert_eq!(tree.get(b"key000250x").unwrap(), None);
    }

    tree.insert(b"key000250x", b"v").unwrap();
    assert_eq!(tree.get(b"key000250x").unwrap(), Some(b"v".to_vec()));
    assert_eq!(tree.get(&key(250)).unwrap(), Some(vec![b'v'; 100]));
}

#[test]
fn failed_splits_release_the_pages_they_wrote() {
    let mut tree = full_disk_tree(500);
    let root = tree.root();
    let live = tree.store().pages.live_pages();

    // a large value forces the leaf to split, which commits several pages before the root
    let big = vec![b'z'; MAX_VAL_SIZE];
    for budget in 0..4 {
        tree.store_mut().commits_left = Some(budget);
        let result = tree.insert(&key(100), &big);
        tree.store_mut().commits_left = None;
        if result.is_ok() {
            break;
        }
        assert_unchanged(&mut tree, root, live, 500);
    }
}

#[test]
fn failed_delete_keeps_the_key() {
    let mut tree = full_disk_tree(500);
    let root = tree.root();
    let live = tree.store().pages.live_pages();

    for budget in 0..2 {
        tree.store_mut().commits_left = Some(budget);
        assert!(matches!(tree.delete(&key(10)), Err(DbError::Io(_))));
        tree.store_mut().commits_left = None;
        assert_unchanged(&mut tree, root, live, 500);
    }

    assert!(tree.delete(&key(10)).unwrap());
    assert_eq!(tree.get(&key(10)).unwrap(), None);
}

#[test]
fn random_operations_match_a_btreemap() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut tree = BTree::new(MemoryPages::new());
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for round in 0..4000 {
        let k = key(rng.gen_range(0..600));
        if rng.gen_bool(0.65) {
            let len = rng.gen_range(0..400);
            let v = vec![(round % 251) as u8; len];
            tree.insert(&k, &v).unwrap();
            model.insert(k, v);
        } else {
            let removed = tree.delete(&k).unwrap();
            assert_eq!(removed, model.remove(&k).is_some());
        }

        if round % 500 == 0 {
            for (k, v) in &model {
                assert_eq!(tree.get(k).unwrap().as_ref(), Some(v));
            }
        }
    }

    let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(tree.scan().unwrap(), expected);
}

#[test]
fn reopen_from_root_pointer() {
    let mut tree = BTree::new(MemoryPages::new());
    for i in 0..500 {
        tree.insert(&key(i), b"v").unwrap();
    }
    let root = tree.root();
    let store = tree.into_store();

    let mut reopened = BTree::open(store, root);
    assert_eq!(reopened.get(&key(123)).unwrap(), Some(b"v".to_vec()));
    assert_eq!(reopened.scan().unwrap().len(), 500);
}
