use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_table::ExtendibleHashTable;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

const PAGE_TABLE_BUCKET_SIZE: usize = 4;

/// Buffer pool manager: a fixed arena of frames caching disk pages.
///
/// Frames are found through an extendible-hash page table and reclaimed by an
/// LRU-K replacer. Every public operation runs under the single pool-level
/// mutex, which owns the free list and the per-frame pin/dirty metadata; the
/// page table and replacer keep their own internal latches and are only ever
/// invoked from inside the pool's critical section.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PagePtr>,
    inner: Mutex<PoolInner>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruKReplacer,
    disk_manager: Arc<DiskManager>,
}

struct PoolInner {
    free_list: VecDeque<FrameId>,
    metas: Vec<FrameMeta>,
}

/// Per-frame bookkeeping, valid only under the pool mutex
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn clear(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.pin_count = 0;
        self.is_dirty = false;
    }
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        db_path: impl AsRef<Path>,
        replacer_k: usize,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager, replacer_k))
    }

    pub fn with_disk_manager(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        replacer_k: usize,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        let mut metas = Vec::with_capacity(pool_size);

        for i in 0..pool_size {
            frames.push(Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            free_list.push_back(i as FrameId);
            metas.push(FrameMeta {
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
            });
        }

        Self {
            pool_size,
            frames,
            inner: Mutex::new(PoolInner { free_list, metas }),
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            replacer: LruKReplacer::new(pool_size, 2),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Number of frames currently eligible for eviction
    pub fn evictable_count(&self) -> usize {
        let _guard = self.inner.lock();
        self.replacer.size()
    }

    /// Dirty flag of a resident page; None when the page is not resident
    pub fn is_page_dirty(&self, page_id: PageId) -> Option<bool> {
        let inner = self.inner.lock();
        let frame_id = self.page_table.find(&page_id)?;
        Some(inner.metas[frame_id as usize].is_dirty)
    }

    /// Create a brand-new page, pinned in an available frame
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut inner = self.inner.lock();

        let frame_id = self.available_frame(&mut inner)?;
        let page_id = self.disk_manager.allocate_page()?;

        {
            let mut page = self.frames[frame_id as usize].write();
            page.reset(page_id);
        }

        let meta = &mut inner.metas[frame_id as usize];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        Ok((self.frames[frame_id as usize].clone(), page_id))
    }

    /// Fetch a page, reading it from disk if it is not resident
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut inner = self.inner.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            inner.metas[frame_id as usize].pin_count += 1;
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok(self.frames[frame_id as usize].clone());
        }

        let frame_id = self.available_frame(&mut inner)?;

        {
            let mut page = self.frames[frame_id as usize].write();
            page.reset(page_id);
            self.disk_manager.read_page(page_id, &mut page)?;
        }

        let meta = &mut inner.metas[frame_id as usize];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        Ok(self.frames[frame_id as usize].clone())
    }

    /// Drop one pin on a page, folding `is_dirty` into its dirty flag.
    ///
    /// Returns false when the page is not resident or already unpinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut inner = self.inner.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };

        let meta = &mut inner.metas[frame_id as usize];
        if meta.pin_count == 0 {
            return false;
        }

        if is_dirty {
            meta.is_dirty = true;
        }
        meta.pin_count -= 1;
        if meta.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Write a resident page back to disk and clear its dirty flag
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut inner = self.inner.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Err(BufferPoolError::PageNotFound(page_id));
        };

        {
            let page = self.frames[frame_id as usize].read();
            self.disk_manager.write_page(&page)?;
        }
        inner.metas[frame_id as usize].is_dirty = false;

        Ok(())
    }

    /// Flush every resident page
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();

        for frame_id in 0..self.pool_size {
            let meta = &mut inner.metas[frame_id];
            if meta.page_id == INVALID_PAGE_ID {
                continue;
            }
            {
                let page = self.frames[frame_id].read();
                self.disk_manager.write_page(&page)?;
            }
            meta.is_dirty = false;
        }

        Ok(())
    }

    /// Remove a page from the pool and return its id to the disk allocator.
    ///
    /// Deleting a non-resident page succeeds trivially; a pinned page cannot
    /// be deleted.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(());
        };

        if inner.metas[frame_id as usize].pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        self.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        inner.free_list.push_back(frame_id);
        inner.metas[frame_id as usize].clear();
        self.frames[frame_id as usize].write().reset(INVALID_PAGE_ID);
        self.disk_manager.deallocate_page(page_id);

        Ok(())
    }

    /// Pop a free frame or evict a victim, writing back its contents when
    /// dirty. Called with the pool mutex already held.
    fn available_frame(&self, inner: &mut PoolInner) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(victim) = self.replacer.evict() else {
            return Err(BufferPoolError::BufferPoolFull);
        };

        let meta = &mut inner.metas[victim as usize];
        if meta.is_dirty {
            log::debug!("evicting dirty page {}, writing back", meta.page_id);
            let page = self.frames[victim as usize].read();
            self.disk_manager.write_page(&page)?;
        }
        self.page_table.remove(&meta.page_id);
        meta.clear();

        Ok(victim)
    }
}
