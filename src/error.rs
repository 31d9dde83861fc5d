use thiserror::Error;
use std::io;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("index {index} is out of range for a node with {num_keys} keys")]
    IndexOutOfRange { index: usize, num_keys: usize },
    #[error("misuse: {0}")]
    Misuse(&'static str),
    #[error("key length {0} exceeds the maximum of {max}", max = crate::storage::page::MAX_KEY_SIZE)]
    KeyTooLarge(usize),
    #[error("value length {0} exceeds the maximum of {max}", max = crate::storage::page::MAX_VAL_SIZE)]
    ValueTooLarge(usize),
    #[error("node of {size} bytes does not fit in {capacity} bytes")]
    NodeTooLarge { size: usize, capacity: usize },
    #[error("the empty key is reserved")]
    EmptyKey,
    #[error("max node size {required} exceeds the page size {page_size}")]
    InvalidLayout { required: usize, page_size: usize },
    #[error("corrupted node: {0}")]
    Corrupted(String),
    #[error("page {0} not found")]
    PageNotFound(u64),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type DbResult<T> = Result<T, DbError>;
