pub mod storage;
pub mod error;

pub use error::{DbError, DbResult};
pub use storage::btree::BTree;
pub use storage::node::BNode;
pub use storage::pager::{MemoryPages, PageStore, Pager};

/// One-time startup check of the node layout. Call before touching any node.
pub fn init() -> DbResult<()> {
    storage::page::check_layout()?;
    log::debug!(
        "node layout ok: page size {}, max key {}, max value {}",
        storage::page::PAGE_SIZE,
        storage::page::MAX_KEY_SIZE,
        storage::page::MAX_VAL_SIZE
    );
    Ok(())
}
