use std::fmt::Write as _;
use std::marker::PhantomData;
use std::sync::Arc;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::common::types::{PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::{self, BTreePage, BTreePageType, InternalPage, LeafPage};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;

pub(crate) type PageReadGuard = ArcRwLockReadGuard<RawRwLock, crate::common::types::Page>;
pub(crate) type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, crate::common::types::Page>;
pub(crate) type RootWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageId>;

/// What a mutating descent intends to do; drives the crabbing safety
/// predicate. Searches are always safe and never consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessMode {
    Insert,
    Delete,
}

/// Where a read-only descent is headed
pub(crate) enum Target<'a, K> {
    Key(&'a K),
    First,
    Last,
}

/// Per-operation latch bookkeeping for pessimistic descents: the root-id
/// write guard plus the ordered stack of page write guards, topmost ancestor
/// first. Releasing drains in capture order, dropping each latch before
/// unpinning its page.
pub(crate) struct LatchContext<'a> {
    buffer_pool: &'a BufferPoolManager,
    pub(crate) root_guard: Option<RootWriteGuard>,
    stack: Vec<PageWriteGuard>,
}

impl<'a> LatchContext<'a> {
    pub(crate) fn new(buffer_pool: &'a BufferPoolManager) -> Self {
        Self {
            buffer_pool,
            root_guard: None,
            stack: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, guard: PageWriteGuard) {
        self.stack.push(guard);
    }

    pub(crate) fn pop(&mut self) -> Option<PageWriteGuard> {
        self.stack.pop()
    }

    /// Release every ancestor captured so far; used mid-descent once a safe
    /// child proves they cannot be touched
    pub(crate) fn release_ancestors(&mut self) {
        self.release_all(false);
    }

    /// Drain the whole context, dropping latches in capture order and
    /// unpinning each page
    pub(crate) fn release_all(&mut self, dirty: bool) {
        self.root_guard = None;
        for guard in self.stack.drain(..) {
            let page_id = guard.page_id;
            drop(guard);
            self.buffer_pool.unpin_page(page_id, dirty);
        }
    }
}

/// B+ tree index over the buffer pool.
///
/// Pages are reached exclusively through pin/fetch; descent follows the
/// crabbing protocol: an optimistic read-coupled pass that only write-latches
/// the target leaf, restarted as a pessimistic write-latched pass when the
/// leaf turns out unsafe for the operation.
pub struct BPlusTree<K: IndexKey> {
    pub(crate) index_name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) root_page_id: Arc<RwLock<PageId>>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    pub(crate) _phantom: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Open (or register) the named index, loading its root from the header
    /// page
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        debug_assert!(leaf_max_size >= 2 && internal_max_size >= 3);
        debug_assert!(leaf_max_size <= LeafPage::<K>::capacity());
        debug_assert!(internal_max_size <= InternalPage::<K>::capacity());

        let index_name = index_name.into();
        let header_ptr = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let root_page_id = {
            let mut header = header_ptr.write();
            match HeaderPage::get_root_id(&header, &index_name) {
                Some(root) => root,
                None => {
                    HeaderPage::insert_record(&mut header, &index_name, INVALID_PAGE_ID);
                    INVALID_PAGE_ID
                }
            }
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, true);
        // Materialize the header page on disk so the allocator never hands
        // its id out again
        buffer_pool.flush_page(HEADER_PAGE_ID)?;

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: Arc::new(RwLock::new(root_page_id)),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    /// Open the named index with page-capacity-derived fan-outs
    pub fn with_default_sizes(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
    ) -> Result<Self, BTreeError> {
        let leaf_max = LeafPage::<K>::capacity();
        let internal_max = InternalPage::<K>::capacity();
        Self::new(index_name, buffer_pool, leaf_max, internal_max)
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup: push the match (if any) into `result`
    pub fn get(&self, key: &K, result: &mut Vec<Rid>) -> Result<bool, BTreeError> {
        let Some(guard) = self.find_leaf_read(Target::Key(key))? else {
            return Ok(false);
        };

        let leaf = LeafPage::<K>::decode(&guard);
        let found = leaf.lookup(key);
        Self::finish_read(&self.buffer_pool, guard);

        match found {
            Some(rid) => {
                result.push(rid);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A page is safe when the pending operation provably cannot change its
    /// parent
    pub(crate) fn is_page_safe(node: &BTreePage<K>, op: AccessMode, is_root: bool) -> bool {
        match op {
            AccessMode::Insert => {
                if node.is_leaf() {
                    // A leaf hitting max_size splits immediately, so the last
                    // slot cannot be treated as usable headroom
                    node.size() < node.max_size() - 1
                } else {
                    node.size() < node.max_size()
                }
            }
            AccessMode::Delete => {
                if is_root {
                    if node.is_leaf() {
                        node.size() > 1
                    } else {
                        node.size() > 2
                    }
                } else {
                    node.size() > node.min_size()
                }
            }
        }
    }

    /// Read-coupled descent to a leaf, for searches and iterator anchoring.
    /// Returns None when the tree is empty.
    pub(crate) fn find_leaf_read(
        &self,
        target: Target<'_, K>,
    ) -> Result<Option<PageReadGuard>, BTreeError> {
        let root_guard = self.root_page_id.read_arc();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut page_id = *root_guard;
        let mut root_latch = Some(root_guard);
        let mut parent: Option<PageReadGuard> = None;

        loop {
            let ptr = match self.buffer_pool.fetch_page(page_id) {
                Ok(ptr) => ptr,
                Err(e) => {
                    Self::release_read_parent(&self.buffer_pool, parent.take());
                    return Err(e.into());
                }
            };
            let guard = ptr.read_arc();

            // The parent latch (or root latch) is released only after the
            // child latch is held
            Self::release_read_parent(&self.buffer_pool, parent.take());
            root_latch.take();

            let page_type = match page::page_type(&guard) {
                Ok(page_type) => page_type,
                Err(e) => {
                    Self::finish_read(&self.buffer_pool, guard);
                    return Err(e);
                }
            };
            match page_type {
                BTreePageType::Leaf => return Ok(Some(guard)),
                BTreePageType::Internal => {
                    let internal = InternalPage::<K>::decode(&guard);
                    page_id = match &target {
                        Target::Key(key) => internal.lookup(key),
                        Target::First => internal.value_at(0),
                        Target::Last => internal.value_at(internal.size() - 1),
                    };
                    parent = Some(guard);
                }
            }
        }
    }

    /// Optimistic first pass for a mutation: read-coupled descent that
    /// write-latches only the target leaf. Returns None when the tree is
    /// empty.
    pub(crate) fn find_leaf_write(&self, key: &K) -> Result<Option<PageWriteGuard>, BTreeError> {
        let root_guard = self.root_page_id.read_arc();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut page_id = *root_guard;
        let mut root_latch = Some(root_guard);
        let mut parent: Option<PageReadGuard> = None;

        loop {
            let ptr = match self.buffer_pool.fetch_page(page_id) {
                Ok(ptr) => ptr,
                Err(e) => {
                    Self::release_read_parent(&self.buffer_pool, parent.take());
                    return Err(e.into());
                }
            };
            let guard = ptr.read_arc();
            let page_type = match page::page_type(&guard) {
                Ok(page_type) => page_type,
                Err(e) => {
                    Self::finish_read(&self.buffer_pool, guard);
                    Self::release_read_parent(&self.buffer_pool, parent.take());
                    return Err(e);
                }
            };

            if page_type == BTreePageType::Leaf {
                // Upgrade to a write latch while the parent (or root) read
                // latch still pins the structure above us: the leaf may gain
                // or lose entries in the gap, never move or split
                drop(guard);
                let write_guard = ptr.write_arc();
                Self::release_read_parent(&self.buffer_pool, parent.take());
                root_latch.take();
                return Ok(Some(write_guard));
            }

            Self::release_read_parent(&self.buffer_pool, parent.take());
            root_latch.take();

            let internal = InternalPage::<K>::decode(&guard);
            page_id = internal.lookup(key);
            parent = Some(guard);
        }
    }

    /// Pessimistic second pass: write-latch from the root down, releasing
    /// every captured ancestor as soon as a child is safe. The caller must
    /// have stored the root-id write guard in `ctx`; on return the stack
    /// holds the retained ancestors with the target leaf on top.
    pub(crate) fn find_leaf_pessimistic(
        &self,
        key: &K,
        op: AccessMode,
        ctx: &mut LatchContext<'_>,
    ) -> Result<(), BTreeError> {
        let mut page_id = ctx
            .root_guard
            .as_deref()
            .copied()
            .expect("pessimistic descent requires the root latch");

        loop {
            let ptr = match self.buffer_pool.fetch_page(page_id) {
                Ok(ptr) => ptr,
                Err(e) => {
                    ctx.release_all(false);
                    return Err(e.into());
                }
            };
            let guard = ptr.write_arc();
            let node = match BTreePage::<K>::decode(&guard) {
                Ok(node) => node,
                Err(e) => {
                    Self::finish_write(&self.buffer_pool, guard, false);
                    ctx.release_all(false);
                    return Err(e);
                }
            };

            let is_root = node.parent_page_id() == INVALID_PAGE_ID;
            if Self::is_page_safe(&node, op, is_root) {
                ctx.release_ancestors();
            }

            match node {
                BTreePage::Leaf(_) => {
                    ctx.push(guard);
                    return Ok(());
                }
                BTreePage::Internal(internal) => {
                    page_id = internal.lookup(key);
                    ctx.push(guard);
                }
            }
        }
    }

    /// Record the current root id for this index in the header page
    pub(crate) fn update_root_record(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let header_ptr = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut header = header_ptr.write();
            if !HeaderPage::update_record(&mut header, &self.index_name, root_page_id) {
                HeaderPage::insert_record(&mut header, &self.index_name, root_page_id);
            }
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }

    pub(crate) fn finish_write(buffer_pool: &BufferPoolManager, guard: PageWriteGuard, dirty: bool) {
        let page_id = guard.page_id;
        drop(guard);
        buffer_pool.unpin_page(page_id, dirty);
    }

    pub(crate) fn finish_read(buffer_pool: &BufferPoolManager, guard: PageReadGuard) {
        let page_id = guard.page_id;
        drop(guard);
        buffer_pool.unpin_page(page_id, false);
    }

    fn release_read_parent(buffer_pool: &BufferPoolManager, parent: Option<PageReadGuard>) {
        if let Some(guard) = parent {
            let page_id = guard.page_id;
            drop(guard);
            buffer_pool.unpin_page(page_id, false);
        }
    }

    /// Re-home a child page after a split, merge, or root change
    pub(crate) fn reparent(&self, child: PageId, parent: PageId) -> Result<(), BTreeError> {
        let ptr = self.buffer_pool.fetch_page(child)?;
        {
            let mut page = ptr.write();
            page::set_parent_page_id(&mut page, parent);
        }
        self.buffer_pool.unpin_page(child, true);
        Ok(())
    }

    /// Plain-text listing of every page, for debugging
    pub fn dump(&self) -> Result<String, BTreeError> {
        let root = self.root_page_id();
        let mut out = String::new();
        if root == INVALID_PAGE_ID {
            out.push_str("(empty tree)\n");
            return Ok(out);
        }
        self.dump_page(root, &mut out)?;
        Ok(out)
    }

    fn dump_page(&self, page_id: PageId, out: &mut String) -> Result<(), BTreeError> {
        let ptr = self.buffer_pool.fetch_page(page_id)?;
        let node = {
            let guard = ptr.read();
            BTreePage::<K>::decode(&guard)?
        };
        match &node {
            BTreePage::Leaf(leaf) => {
                let _ = writeln!(
                    out,
                    "leaf {} parent {} next {}: {:?}",
                    leaf.page_id,
                    leaf.parent_page_id,
                    leaf.next_page_id,
                    leaf.entries.iter().map(|(k, _)| k).collect::<Vec<_>>()
                );
            }
            BTreePage::Internal(internal) => {
                let _ = writeln!(
                    out,
                    "internal {} parent {}: {:?}",
                    internal.page_id,
                    internal.parent_page_id,
                    internal
                        .entries
                        .iter()
                        .enumerate()
                        .map(|(i, (k, v))| if i == 0 {
                            format!("(_, {})", v)
                        } else {
                            format!("({:?}, {})", k, v)
                        })
                        .collect::<Vec<_>>()
                );
            }
        }
        self.buffer_pool.unpin_page(page_id, false);

        if let BTreePage::Internal(internal) = node {
            for &(_, child) in &internal.entries {
                self.dump_page(child, out)?;
            }
        }
        Ok(())
    }

    /// Graphviz rendering of the tree, for debugging
    pub fn to_dot(&self) -> Result<String, BTreeError> {
        let mut out = String::from("digraph btree {\nnode [shape=record];\n");
        let root = self.root_page_id();
        if root != INVALID_PAGE_ID {
            self.dot_page(root, &mut out)?;
        }
        out.push_str("}\n");
        Ok(out)
    }

    fn dot_page(&self, page_id: PageId, out: &mut String) -> Result<(), BTreeError> {
        let ptr = self.buffer_pool.fetch_page(page_id)?;
        let node = {
            let guard = ptr.read();
            BTreePage::<K>::decode(&guard)?
        };
        self.buffer_pool.unpin_page(page_id, false);

        match node {
            BTreePage::Leaf(leaf) => {
                let keys: Vec<String> =
                    leaf.entries.iter().map(|(k, _)| format!("{:?}", k)).collect();
                let _ = writeln!(out, "p{} [label=\"L{}|{}\"];", leaf.page_id, leaf.page_id, keys.join("|"));
                if leaf.next_page_id != INVALID_PAGE_ID {
                    let _ = writeln!(out, "p{} -> p{} [style=dashed];", leaf.page_id, leaf.next_page_id);
                }
            }
            BTreePage::Internal(internal) => {
                let keys: Vec<String> = internal
                    .entries
                    .iter()
                    .enumerate()
                    .map(|(i, (k, _))| if i == 0 { "_".to_string() } else { format!("{:?}", k) })
                    .collect();
                let _ = writeln!(out, "p{} [label=\"I{}|{}\"];", internal.page_id, internal.page_id, keys.join("|"));
                for &(_, child) in &internal.entries {
                    let _ = writeln!(out, "p{} -> p{};", internal.page_id, child);
                    self.dot_page(child, out)?;
                }
            }
        }
        Ok(())
    }
}
