// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use index::btree::{BPlusTree, BPlusTreeIter, BTreeError, IndexKey};
pub use storage::buffer::{BufferPoolError, BufferPoolManager, ExtendibleHashTable, LruKReplacer};
pub use storage::disk::DiskManager;
pub use transaction::{
    AbortReason, IsolationLevel, LockManager, LockMode, Transaction, TransactionError,
    TransactionManager, TransactionState,
};
