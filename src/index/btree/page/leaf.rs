use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, Page, PageId, Rid, INVALID_PAGE_ID, PAGE_SIZE};
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::{layout, write_page_type, BTreePageType};

const RID_SIZE: usize = 8;

/// Decoded leaf page: a sorted `(key, rid)` array plus the sibling link.
///
/// `min_size` is `max_size / 2`; a leaf must never sit at `max_size`, so the
/// tree splits the moment an insertion fills it.
pub struct LeafPage<K> {
    pub lsn: Lsn,
    pub max_size: usize,
    pub parent_page_id: PageId,
    pub page_id: PageId,
    pub next_page_id: PageId,
    pub entries: Vec<(K, Rid)>,
}

impl<K: IndexKey> LeafPage<K> {
    pub fn new(page_id: PageId, parent_page_id: PageId, max_size: usize) -> Self {
        Self {
            lsn: 0,
            max_size,
            parent_page_id,
            page_id,
            next_page_id: INVALID_PAGE_ID,
            entries: Vec::with_capacity(max_size),
        }
    }

    /// Largest pair count a leaf of this key type can hold on one page
    pub fn capacity() -> usize {
        (PAGE_SIZE - layout::LEAF_HEADER_SIZE) / (K::ENCODED_SIZE + RID_SIZE)
    }

    pub fn decode(page: &Page) -> Self {
        // The stored size cannot exceed what physically fits in the payload
        let size = (LittleEndian::read_u32(&page.data[layout::SIZE..layout::SIZE + 4]) as usize)
            .min(Self::capacity());
        let mut entries = Vec::with_capacity(size);
        let pair = K::ENCODED_SIZE + RID_SIZE;
        for i in 0..size {
            let offset = layout::LEAF_HEADER_SIZE + i * pair;
            let key = K::read_from(&page.data[offset..offset + K::ENCODED_SIZE]);
            let rid_off = offset + K::ENCODED_SIZE;
            let rid = Rid::new(
                LittleEndian::read_u32(&page.data[rid_off..rid_off + 4]),
                LittleEndian::read_u32(&page.data[rid_off + 4..rid_off + 8]),
            );
            entries.push((key, rid));
        }

        Self {
            lsn: LittleEndian::read_u32(&page.data[layout::LSN..layout::LSN + 4]),
            max_size: LittleEndian::read_u32(&page.data[layout::MAX_SIZE..layout::MAX_SIZE + 4])
                as usize,
            parent_page_id: LittleEndian::read_u32(
                &page.data[layout::PARENT_PAGE_ID..layout::PARENT_PAGE_ID + 4],
            ),
            page_id: LittleEndian::read_u32(&page.data[layout::PAGE_ID..layout::PAGE_ID + 4]),
            next_page_id: LittleEndian::read_u32(
                &page.data[layout::NEXT_PAGE_ID..layout::NEXT_PAGE_ID + 4],
            ),
            entries,
        }
    }

    pub fn encode(&self, page: &mut Page) {
        write_page_type(page, BTreePageType::Leaf);
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
        LittleEndian::write_u32(
            &mut page.data[layout::NEXT_PAGE_ID..layout::NEXT_PAGE_ID + 4],
            self.next_page_id,
        );

        let pair = K::ENCODED_SIZE + RID_SIZE;
        for (i, (key, rid)) in self.entries.iter().enumerate() {
            let offset = layout::LEAF_HEADER_SIZE + i * pair;
            key.write_to(&mut page.data[offset..offset + K::ENCODED_SIZE]);
            let rid_off = offset + K::ENCODED_SIZE;
            LittleEndian::write_u32(&mut page.data[rid_off..rid_off + 4], rid.page_id);
            LittleEndian::write_u32(&mut page.data[rid_off + 4..rid_off + 8], rid.slot_num);
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn min_size(&self) -> usize {
        self.max_size / 2
    }

    pub fn key_at(&self, index: usize) -> K {
        self.entries[index].0
    }

    /// Index of the first entry with key >= `key`
    pub fn key_index(&self, key: &K) -> usize {
        self.entries.partition_point(|(k, _)| k < key)
    }

    pub fn lookup(&self, key: &K) -> Option<Rid> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| self.entries[i].1)
    }

    /// Insert into sorted position; duplicates are rejected. Returns the size
    /// after the attempt, so an unchanged size signals a duplicate.
    pub fn insert(&mut self, key: K, rid: Rid) -> usize {
        match self.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(_) => self.entries.len(),
            Err(pos) => {
                self.entries.insert(pos, (key, rid));
                self.entries.len()
            }
        }
    }

    /// Remove a key if present; returns the size after the attempt
    pub fn remove(&mut self, key: &K) -> usize {
        if let Ok(pos) = self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            self.entries.remove(pos);
        }
        self.entries.len()
    }

    /// Move the upper half of the entries into an empty right sibling
    pub fn move_half_to(&mut self, recipient: &mut LeafPage<K>) {
        let split_at = self.min_size();
        recipient.entries.extend(self.entries.drain(split_at..));
    }

    /// Shift the first entry to the end of the left sibling (borrow by a left
    /// neighbour from this, its right neighbour)
    pub fn move_first_to_end(&mut self, recipient: &mut LeafPage<K>) {
        let first = self.entries.remove(0);
        recipient.entries.push(first);
    }

    /// Shift the last entry to the front of the right sibling
    pub fn move_last_to_front(&mut self, recipient: &mut LeafPage<K>) {
        let last = self.entries.pop().expect("leaf underflow during redistribution");
        recipient.entries.insert(0, last);
    }

    /// Append every entry into the left sibling (merge)
    pub fn move_all_to(&mut self, recipient: &mut LeafPage<K>) {
        recipient.entries.append(&mut self.entries);
        recipient.next_page_id = self.next_page_id;
    }
}
