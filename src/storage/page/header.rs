use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};

/// Maximum length of an index name stored in a header record
pub const MAX_NAME_LEN: usize = 32;

const RECORD_SIZE: usize = MAX_NAME_LEN + 4;
const COUNT_SIZE: usize = 4;
const MAX_RECORDS: usize = (PAGE_SIZE - COUNT_SIZE) / RECORD_SIZE;

/// View over the header page, which lives at a fixed page id and maps index
/// names to their root page ids.
///
/// Layout: `record_count(4)` followed by a packed array of records, each a
/// zero-padded name of `MAX_NAME_LEN` bytes plus a 4-byte root page id.
pub struct HeaderPage;

impl HeaderPage {
    pub fn record_count(page: &Page) -> usize {
        LittleEndian::read_u32(&page.data[0..4]) as usize
    }

    fn set_record_count(page: &mut Page, count: usize) {
        LittleEndian::write_u32(&mut page.data[0..4], count as u32);
    }

    fn record_offset(index: usize) -> usize {
        COUNT_SIZE + index * RECORD_SIZE
    }

    fn name_at(page: &Page, index: usize) -> &[u8] {
        let offset = Self::record_offset(index);
        let name = &page.data[offset..offset + MAX_NAME_LEN];
        let end = name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        &name[..end]
    }

    fn find_record(page: &Page, name: &str) -> Option<usize> {
        (0..Self::record_count(page)).find(|&i| Self::name_at(page, i) == name.as_bytes())
    }

    /// Append a `(name, root_page_id)` record; false when the name is too
    /// long, already present, or the page is full
    pub fn insert_record(page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        if name.len() > MAX_NAME_LEN || Self::find_record(page, name).is_some() {
            return false;
        }
        let count = Self::record_count(page);
        if count >= MAX_RECORDS {
            return false;
        }

        let offset = Self::record_offset(count);
        page.data[offset..offset + MAX_NAME_LEN].fill(0);
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(
            &mut page.data[offset + MAX_NAME_LEN..offset + RECORD_SIZE],
            root_page_id,
        );
        Self::set_record_count(page, count + 1);
        true
    }

    /// Update the root page id of an existing record
    pub fn update_record(page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        let Some(index) = Self::find_record(page, name) else {
            return false;
        };
        let offset = Self::record_offset(index);
        LittleEndian::write_u32(
            &mut page.data[offset + MAX_NAME_LEN..offset + RECORD_SIZE],
            root_page_id,
        );
        true
    }

    /// Remove a record, compacting the array
    pub fn delete_record(page: &mut Page, name: &str) -> bool {
        let Some(index) = Self::find_record(page, name) else {
            return false;
        };
        let count = Self::record_count(page);
        let from = Self::record_offset(index + 1);
        let to = Self::record_offset(index);
        let end = Self::record_offset(count);
        page.data.copy_within(from..end, to);
        Self::set_record_count(page, count - 1);
        true
    }

    /// Root page id recorded for an index, if any
    pub fn get_root_id(page: &Page, name: &str) -> Option<PageId> {
        let index = Self::find_record(page, name)?;
        let offset = Self::record_offset(index);
        Some(LittleEndian::read_u32(
            &page.data[offset + MAX_NAME_LEN..offset + RECORD_SIZE],
        ))
    }
}
