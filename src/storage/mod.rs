pub mod page;
pub mod node;
pub mod ops;
pub mod pager;
pub mod btree;
