use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::error::{DbError, DbResult};
use crate::storage::node::BNode;
use crate::storage::page::PAGE_SIZE;

/// The page-store contract the tree is built on.
///
/// Pointers are opaque nonzero page numbers. `get` hands back a copy of the
/// committed page, `new` commits a node (it must fit in one page) under a
/// fresh pointer, and `del` releases a pointer nothing references any more.
pub trait PageStore {
    fn get(&mut self, ptr: u64) -> DbResult<BNode>;
    fn new(&mut self, node: &BNode) -> DbResult<u64>;
    fn del(&mut self, ptr: u64) -> DbResult<()>;
}

/// Pages kept in a map. Pointers are handed out in increasing order and never reused.
#[derive(Debug)]
pub struct MemoryPages {
    pages: HashMap<u64, BNode>,
    next: u64,
    freed: u64,
}

impl MemoryPages {
    pub fn new() -> Self {
        MemoryPages { pages: HashMap::new(), next: 1, freed: 0 }
    }

    /// Pages currently allocated.
    pub fn live_pages(&self) -> usize {
        self.pages.len()
    }

    /// Pages released through `del` so far.
    pub fn freed_pages(&self) -> u64 {
        self.freed
    }
}

impl Default for MemoryPages {
    fn default() -> Self {
        MemoryPages::new()
    }
}

impl PageStore for MemoryPages {
    fn get(&mut self, ptr: u64) -> DbResult<BNode> {
        self.pages.get(&ptr).cloned().ok_or(DbError::PageNotFound(ptr))
    }

    fn new(&mut self, node: &BNode) -> DbResult<u64> {
        let page = node.to_page()?;
        let ptr = self.next;
        self.next += 1;
        self.pages.insert(ptr, page);
        Ok(ptr)
    }

    fn del(&mut self, ptr: u64) -> DbResult<()> {
        self.pages.remove(&ptr).ok_or(DbError::PageNotFound(ptr))?;
        self.freed += 1;
        Ok(())
    }
}

/// A single 4 KiB page of data.
struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    fn new() -> Self {
        Page { data: [0; PAGE_SIZE] }
    }
}

/// Pages kept in memory by a `Pager` unless another size is asked for.
pub const DEFAULT_CACHE_PAGES: usize = 256;

/// Pager: a file of 4 KiB pages with a bounded in-memory cache.
///
/// Page `n` lives at byte `n * PAGE_SIZE`. Page 0 is reserved so that pointer
/// 0 never names a node. New pages are appended and written through to the
/// file as soon as they are created; deleted pages are dropped from the cache
/// and never handed out again. Committed pages never change, so every cached
/// page is clean and the oldest one is simply dropped when the cache is full.
pub struct Pager {
    file: File,

    /// The number of pages that are known to be on disk.
    file_length_pages: u64,

    /// The total number of pages the pager has handed out or found on disk.
    num_pages: u64,

    /// Loaded pages, at most `cache_pages` of them.
    cache: HashMap<u64, Box<Page>>,

    /// Cached page numbers, oldest first.
    order: VecDeque<u64>,

    cache_pages: usize,

    freed: HashSet<u64>,
}

impl Pager {
    /// Open (or create) the page file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Pager::with_cache_pages(path, DEFAULT_CACHE_PAGES)
    }

    /// Like `new`, keeping at most `cache_pages` pages (at least one) in memory.
    pub fn with_cache_pages<P: AsRef<Path>>(path: P, cache_pages: usize) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();
        let file_length_pages = file_len / PAGE_SIZE as u64;

        Ok(Pager {
            file,
            file_length_pages,
            num_pages: file_length_pages.max(1),
            cache: HashMap::new(),
            order: VecDeque::new(),
            cache_pages: cache_pages.max(1),
            freed: HashSet::new(),
        })
    }

    fn check_ptr(&self, ptr: u64) -> DbResult<()> {
        if ptr == 0 || ptr >= self.num_pages || self.freed.contains(&ptr) {
            return Err(DbError::PageNotFound(ptr));
        }
        Ok(())
    }

    /// Put a page in the cache, dropping the oldest pages to make room.
    fn cache_page(&mut self, page_num: u64, page: Box<Page>) {
        while self.cache.len() >= self.cache_pages {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.cache.remove(&oldest);
            debug!("pager: evicted page {}", oldest);
        }
        self.cache.insert(page_num, page);
        self.order.push_back(page_num);
    }

    fn uncache_page(&mut self, page_num: u64) {
        if self.cache.remove(&page_num).is_some() {
            self.order.retain(|&p| p != page_num);
        }
    }

    /// Load a page into the cache, reading it from disk if it is not there yet.
    fn load_page(&mut self, page_num: u64) -> DbResult<&Page> {
        if !self.cache.contains_key(&page_num) {
            let mut page = Box::new(Page::new());
            if page_num < self.file_length_pages {
                self.file.seek(SeekFrom::Start(page_num * PAGE_SIZE as u64))?;
                self.file.read_exact(&mut page.data)?;
            }
            self.cache_page(page_num, page);
        }
        self.cache
            .get(&page_num)
            .map(|page| page.as_ref())
            .ok_or(DbError::PageNotFound(page_num))
    }

    /// Write the cached page `page_num` back to disk.
    fn flush_page(&mut self, page_num: u64) -> DbResult<()> {
        if let Some(page) = self.cache.get(&page_num) {
            self.file.seek(SeekFrom::Start(page_num * PAGE_SIZE as u64))?;
            self.file.write_all(&page.data)?;
            self.file.flush()?;

            if page_num >= self.file_length_pages {
                self.file_length_pages = page_num + 1;
            }
        }
        Ok(())
    }

    /// Force everything written so far down to the device.
    pub fn sync(&mut self) -> DbResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn file_length_pages(&self) -> u64 {
        self.file_length_pages
    }

    /// Pages handed out or found on disk, including the reserved page 0.
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    pub fn freed_pages(&self) -> usize {
        self.freed.len()
    }

    /// Pages currently held in memory.
    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }
}

impl PageStore for Pager {
    fn get(&mut self, ptr: u64) -> DbResult<BNode> {
        self.check_ptr(ptr)?;
        let page = self.load_page(ptr)?;
        BNode::from_bytes(&page.data)
    }

    fn new(&mut self, node: &BNode) -> DbResult<u64> {
        let node = node.to_page()?;
        let ptr = self.num_pages;
        self.num_pages += 1;

        let mut page = Box::new(Page::new());
        page.data.copy_from_slice(node.as_bytes());
        self.cache_page(ptr, page);
        self.flush_page(ptr)?;
        debug!("pager: wrote page {}", ptr);
        Ok(ptr)
    }

    fn del(&mut self, ptr: u64) -> DbResult<()> {
        self.check_ptr(ptr)?;
        self.uncache_page(ptr);
        self.freed.insert(ptr);
        debug!("pager: freed page {}", ptr);
        Ok(())
    }
}
