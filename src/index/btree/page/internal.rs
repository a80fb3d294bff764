use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, Page, PageId, PAGE_SIZE};
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::{layout, write_page_type, BTreePageType};

const CHILD_SIZE: usize = 4;

/// Decoded internal page: a sorted `(key, child_page_id)` array.
///
/// The first slot's key is a placeholder anchoring the "less than the first
/// real key" child; every lookup and split treats index 0 as value-only.
/// `min_size` is `max_size / 2` rounded up.
pub struct InternalPage<K> {
    pub lsn: Lsn,
    pub max_size: usize,
    pub parent_page_id: PageId,
    pub page_id: PageId,
    pub entries: Vec<(K, PageId)>,
}

impl<K: IndexKey> InternalPage<K> {
    pub fn new(page_id: PageId, parent_page_id: PageId, max_size: usize) -> Self {
        Self {
            lsn: 0,
            max_size,
            parent_page_id,
            page_id,
            entries: Vec::with_capacity(max_size + 1),
        }
    }

    /// Largest pair count an internal page of this key type can hold
    pub fn capacity() -> usize {
        (PAGE_SIZE - layout::INTERNAL_HEADER_SIZE) / (K::ENCODED_SIZE + CHILD_SIZE)
    }

    pub fn decode(page: &Page) -> Self {
        // The stored size cannot exceed what physically fits in the payload
        let size = (LittleEndian::read_u32(&page.data[layout::SIZE..layout::SIZE + 4]) as usize)
            .min(Self::capacity());
        let mut entries = Vec::with_capacity(size);
        let pair = K::ENCODED_SIZE + CHILD_SIZE;
        for i in 0..size {
            let offset = layout::INTERNAL_HEADER_SIZE + i * pair;
            let key = K::read_from(&page.data[offset..offset + K::ENCODED_SIZE]);
            let child = LittleEndian::read_u32(
                &page.data[offset + K::ENCODED_SIZE..offset + K::ENCODED_SIZE + 4],
            );
            entries.push((key, child));
        }

        Self {
            lsn: LittleEndian::read_u32(&page.data[layout::LSN..layout::LSN + 4]),
            max_size: LittleEndian::read_u32(&page.data[layout::MAX_SIZE..layout::MAX_SIZE + 4])
                as usize,
            parent_page_id: LittleEndian::read_u32(
                &page.data[layout::PARENT_PAGE_ID..layout::PARENT_PAGE_ID + 4],
            ),
            page_id: LittleEndian::read_u32(&page.data[layout::PAGE_ID..layout::PAGE_ID + 4]),
            entries,
        }
    }

    pub fn encode(&self, page: &mut Page) {
        write_page_type(page, BTreePageType::Internal);
        LittleEndian::write_u32(&mut page.data[layout::LSN..layout::LSN + 4], self.lsn);
        LittleEndian::write_u32(
            &mut page.data[layout::SIZE..layout::SIZE + 4],
            self.entries.len() as u32,
        );
        LittleEndian::write_u32(
            &mut page.data[layout::MAX_SIZE..layout::MAX_SIZE + 4],
            self.max_size as u32,
        );
        LittleEndian::write_u32(
            &mut page.data[layout::PARENT_PAGE_ID..layout::PARENT_PAGE_ID + 4],
            self.parent_page_id,
        );
        LittleEndian::write_u32(
            &mut page.data[layout::PAGE_ID..layout::PAGE_ID + 4],
            self.page_id,
        );

        let pair = K::ENCODED_SIZE + CHILD_SIZE;
        for (i, (key, child)) in self.entries.iter().enumerate() {
            let offset = layout::INTERNAL_HEADER_SIZE + i * pair;
            key.write_to(&mut page.data[offset..offset + K::ENCODED_SIZE]);
            LittleEndian::write_u32(
                &mut page.data[offset + K::ENCODED_SIZE..offset + K::ENCODED_SIZE + 4],
                *child,
            );
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn min_size(&self) -> usize {
        (self.max_size + 1) / 2
    }

    pub fn key_at(&self, index: usize) -> K {
        self.entries[index].0
    }

    pub fn set_key_at(&mut self, index: usize, key: K) {
        self.entries[index].0 = key;
    }

    pub fn value_at(&self, index: usize) -> PageId {
        self.entries[index].1
    }

    /// Position of a child page id among the values
    pub fn value_index(&self, child: PageId) -> Option<usize> {
        self.entries.iter().position(|(_, v)| *v == child)
    }

    /// Child covering `key`: the child at the last separator <= `key`
    pub fn lookup(&self, key: &K) -> PageId {
        let pos = self.entries[1..].partition_point(|(k, _)| k <= key);
        self.entries[pos].1
    }

    /// Seed a fresh root after the old root split
    pub fn populate_new_root(&mut self, left: PageId, key: K, right: PageId) {
        self.entries.clear();
        self.entries.push((key, left));
        self.entries.push((key, right));
    }

    /// Insert `(key, child)` just after the entry holding `after_child`;
    /// returns the size after insertion
    pub fn insert_after(&mut self, after_child: PageId, key: K, child: PageId) -> Option<usize> {
        let index = self.value_index(after_child)? + 1;
        self.entries.insert(index, (key, child));
        Some(self.entries.len())
    }

    pub fn remove(&mut self, index: usize) {
        self.entries.remove(index);
    }

    /// Move the upper half of the entries into an empty right sibling; the
    /// recipient's first key becomes the separator the caller pushes up
    pub fn move_half_to(&mut self, recipient: &mut InternalPage<K>) {
        let split_at = self.min_size();
        recipient.entries.extend(self.entries.drain(split_at..));
    }

    /// Borrow from the right neighbour: this page's first entry (its anchor
    /// child, keyed by the parent separator) moves to the end of `recipient`
    pub fn move_first_to_end(&mut self, recipient: &mut InternalPage<K>, middle_key: K) {
        self.entries[0].0 = middle_key;
        let first = self.entries.remove(0);
        recipient.entries.push(first);
    }

    /// Borrow from the left neighbour: this page's last entry moves to the
    /// front of `recipient`, whose old anchor is re-keyed by the separator
    pub fn move_last_to_front(&mut self, recipient: &mut InternalPage<K>, middle_key: K) {
        recipient.entries[0].0 = middle_key;
        let last = self.entries.pop().expect("internal underflow during redistribution");
        recipient.entries.insert(0, last);
    }

    /// Merge every entry into the left sibling, re-keying the anchor with the
    /// parent separator
    pub fn move_all_to(&mut self, recipient: &mut InternalPage<K>, middle_key: K) {
        if let Some(first) = self.entries.first_mut() {
            first.0 = middle_key;
        }
        recipient.entries.append(&mut self.entries);
    }
}
