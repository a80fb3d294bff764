use std::fmt;
use std::sync::Arc;
use parking_lot::RwLock;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type; page ids are allocated from 1, 0 marks "no page"
pub type PageId = u32;

/// Sentinel for an absent page reference
pub const INVALID_PAGE_ID: PageId = 0;

/// Fixed page id of the header page holding index roots
pub const HEADER_PAGE_ID: PageId = 1;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Transaction ID type
pub type TxnId = u32;

/// Table OID type
pub type TableOid = u32;

/// LSN (Log Sequence Number) type, sized to its 4-byte on-page field
pub type Lsn = u32;

/// Record identifier: the page a tuple lives on plus its slot within the page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot_num)
    }
}

/// Page structure: the raw byte buffer cached by a frame.
///
/// Pin counts and dirty flags are frame metadata owned by the buffer pool;
/// the page itself carries only its identity and payload so that holders of
/// the page latch never contend with pin/unpin bookkeeping.
pub struct Page {
    pub page_id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: [0; PAGE_SIZE],
        }
    }

    pub fn reset(&mut self, page_id: PageId) {
        self.page_id = page_id;
        self.data.fill(0);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("page_id", &self.page_id).finish()
    }
}

/// Smart pointer to a page; doubles as the per-page latch
pub type PagePtr = Arc<RwLock<Page>>;
