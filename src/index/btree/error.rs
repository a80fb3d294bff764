use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Page {0} is not a B+ tree page")]
    InvalidPageType(PageId),

    #[error("Page {child} is not a child of internal page {parent}")]
    ChildNotFound { parent: PageId, child: PageId },

    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),
}
