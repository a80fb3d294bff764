use std::sync::Arc;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::LeafPage;
use crate::storage::buffer::BufferPoolManager;

use super::base::{BPlusTree, PageReadGuard, Target};

/// Forward iterator over the leaf chain.
///
/// Holds one pinned, read-latched leaf at a time; advancing to the next leaf
/// acquires its read latch before releasing the current one, so the scan and
/// top-down writers can never deadlock. An exhausted iterator equals the
/// end sentinel `(INVALID_PAGE_ID, 0)`.
pub struct BPlusTreeIter<K: IndexKey> {
    buffer_pool: Arc<BufferPoolManager>,
    guard: Option<PageReadGuard>,
    leaf: Option<LeafPage<K>>,
    index: usize,
}

impl<K: IndexKey> BPlusTreeIter<K> {
    fn new(buffer_pool: Arc<BufferPoolManager>, guard: PageReadGuard, index: usize) -> Self {
        let leaf = LeafPage::<K>::decode(&guard);
        Self {
            buffer_pool,
            guard: Some(guard),
            leaf: Some(leaf),
            index,
        }
    }

    fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            guard: None,
            leaf: None,
            index: 0,
        }
    }

    /// Current position as `(page_id, slot)`; the end sentinel once the
    /// chain is exhausted
    pub fn position(&self) -> (PageId, usize) {
        match &self.leaf {
            Some(leaf) => (leaf.page_id, self.index),
            None => (INVALID_PAGE_ID, 0),
        }
    }

    /// Past the last entry of the rightmost reachable leaf, or empty
    pub fn is_end(&self) -> bool {
        match &self.leaf {
            Some(leaf) => self.index >= leaf.size() && leaf.next_page_id == INVALID_PAGE_ID,
            None => true,
        }
    }

    fn release_current(&mut self) {
        if let Some(guard) = self.guard.take() {
            let page_id = guard.page_id;
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false);
        }
        self.leaf = None;
    }

    /// Latch-couple into the next leaf. At the chain end the final leaf stays
    /// latched so the iterator's position remains the end sentinel; returns
    /// whether a further leaf was entered.
    fn advance_leaf(&mut self) -> Result<bool, BTreeError> {
        loop {
            let next_page_id = match &self.leaf {
                Some(leaf) => leaf.next_page_id,
                None => return Ok(false),
            };
            if next_page_id == INVALID_PAGE_ID {
                return Ok(false);
            }

            let next_ptr = match self.buffer_pool.fetch_page(next_page_id) {
                Ok(ptr) => ptr,
                Err(e) => {
                    self.release_current();
                    return Err(e.into());
                }
            };
            // Forward-only coupling: next leaf first, then let go of this one
            let next_guard = next_ptr.read_arc();
            self.release_current();

            self.leaf = Some(LeafPage::<K>::decode(&next_guard));
            self.guard = Some(next_guard);
            self.index = 0;

            // Merges can leave an empty husk in the chain; skip straight over
            if self.leaf.as_ref().is_some_and(|leaf| leaf.size() > 0) {
                return Ok(true);
            }
        }
    }
}

impl<K: IndexKey> Iterator for BPlusTreeIter<K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if self.index < leaf.size() {
                let item = leaf.entries[self.index];
                self.index += 1;
                return Some(item);
            }
            match self.advance_leaf() {
                Ok(true) => continue,
                Ok(false) | Err(_) => return None,
            }
        }
    }
}

impl<K: IndexKey> Drop for BPlusTreeIter<K> {
    fn drop(&mut self) {
        self.release_current();
    }
}

impl<K: IndexKey> BPlusTree<K> {
    /// Iterator positioned at the first entry of the tree
    pub fn iter(&self) -> Result<BPlusTreeIter<K>, BTreeError> {
        match self.find_leaf_read(Target::First)? {
            Some(guard) => {
                let mut iter = BPlusTreeIter::new(self.buffer_pool.clone(), guard, 0);
                // An empty root leaf still yields the end sentinel
                if iter.leaf.as_ref().is_some_and(|leaf| leaf.size() == 0) {
                    iter.advance_leaf()?;
                }
                Ok(iter)
            }
            None => Ok(BPlusTreeIter::empty(self.buffer_pool.clone())),
        }
    }

    /// Iterator positioned at the first entry with key >= `key`
    pub fn iter_from(&self, key: &K) -> Result<BPlusTreeIter<K>, BTreeError> {
        match self.find_leaf_read(Target::Key(key))? {
            Some(guard) => {
                let leaf = LeafPage::<K>::decode(&guard);
                let index = leaf.key_index(key);
                let mut iter = BPlusTreeIter::new(self.buffer_pool.clone(), guard, index);
                if index >= iter.leaf.as_ref().map_or(0, |leaf| leaf.size()) {
                    iter.advance_leaf()?;
                }
                Ok(iter)
            }
            None => Ok(BPlusTreeIter::empty(self.buffer_pool.clone())),
        }
    }

    /// The position one past the last entry of the rightmost leaf; what an
    /// iterator's position converges to
    pub fn end_position(&self) -> Result<(PageId, usize), BTreeError> {
        match self.find_leaf_read(Target::Last)? {
            Some(guard) => {
                let leaf = LeafPage::<K>::decode(&guard);
                let position = (leaf.page_id, leaf.size());
                Self::finish_read(&self.buffer_pool, guard);
                Ok(position)
            }
            None => Ok((INVALID_PAGE_ID, 0)),
        }
    }
}
