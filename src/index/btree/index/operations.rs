use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::{self, InternalPage, LeafPage};
use crate::transaction::concurrency::transaction::Transaction;

use super::base::{AccessMode, BPlusTree, LatchContext, PageWriteGuard, RootWriteGuard};

impl<K: IndexKey> BPlusTree<K> {
    /// Insert a key/rid pair; duplicates are rejected and return false.
    ///
    /// The optimistic pass handles leaves with headroom; a leaf that would
    /// fill up restarts the operation as a pessimistic write-latched descent.
    pub fn insert(
        &self,
        key: K,
        rid: Rid,
        _txn: Option<&Transaction>,
    ) -> Result<bool, BTreeError> {
        loop {
            {
                let root_guard = self.root_page_id.read_arc();
                if *root_guard == INVALID_PAGE_ID {
                    drop(root_guard);
                    let mut root_write = self.root_page_id.write_arc();
                    // Another inserter may have raced us to the write latch
                    if *root_write == INVALID_PAGE_ID {
                        self.start_new_tree(&mut root_write, key, rid)?;
                        return Ok(true);
                    }
                }
            }

            // Optimistic pass: only the leaf is write-latched
            let Some(mut guard) = self.find_leaf_write(&key)? else {
                // Tree emptied out between the latches; go around again
                continue;
            };

            let mut leaf = LeafPage::<K>::decode(&guard);
            if leaf.lookup(&key).is_some() {
                Self::finish_write(&self.buffer_pool, guard, false);
                return Ok(false);
            }

            // Safe exactly when the insert cannot fill the leaf
            if leaf.size() < leaf.max_size - 1 {
                leaf.insert(key, rid);
                leaf.encode(&mut guard);
                Self::finish_write(&self.buffer_pool, guard, true);
                return Ok(true);
            }

            // The insert would fill the leaf; fall back to the pessimistic
            // pass
            Self::finish_write(&self.buffer_pool, guard, false);
            return self.insert_pessimistic(key, rid);
        }
    }

    fn insert_pessimistic(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        let mut ctx = LatchContext::new(&self.buffer_pool);
        let root_write = self.root_page_id.write_arc();

        if *root_write == INVALID_PAGE_ID {
            let mut root_write = root_write;
            self.start_new_tree(&mut root_write, key, rid)?;
            return Ok(true);
        }
        ctx.root_guard = Some(root_write);

        self.find_leaf_pessimistic(&key, AccessMode::Insert, &mut ctx)?;
        let mut leaf_guard = ctx
            .pop()
            .expect("pessimistic descent leaves the target leaf on the stack");
        let mut leaf = LeafPage::<K>::decode(&leaf_guard);

        if leaf.lookup(&key).is_some() {
            Self::finish_write(&self.buffer_pool, leaf_guard, false);
            ctx.release_all(false);
            return Ok(false);
        }

        leaf.insert(key, rid);

        if leaf.size() < leaf.max_size {
            leaf.encode(&mut leaf_guard);
            Self::finish_write(&self.buffer_pool, leaf_guard, true);
            ctx.release_all(true);
            return Ok(true);
        }

        // The leaf is full: move its upper half into a fresh right sibling,
        // splice the sibling chain, and push the separator up
        let (sibling_ptr, sibling_page_id) = match self.buffer_pool.new_page() {
            Ok(pair) => pair,
            Err(e) => {
                Self::finish_write(&self.buffer_pool, leaf_guard, false);
                ctx.release_all(false);
                return Err(e.into());
            }
        };
        let mut sibling_guard = sibling_ptr.write_arc();
        let mut sibling = LeafPage::<K>::new(sibling_page_id, leaf.parent_page_id, self.leaf_max_size);
        leaf.move_half_to(&mut sibling);
        sibling.next_page_id = leaf.next_page_id;
        leaf.next_page_id = sibling_page_id;

        let separator = sibling.key_at(0);
        log::debug!("leaf {} split, new sibling {}", leaf.page_id, sibling_page_id);

        leaf.encode(&mut leaf_guard);
        sibling.encode(&mut sibling_guard);

        self.insert_into_parent(&mut ctx, leaf_guard, separator, sibling_guard)?;
        ctx.release_all(true);
        Ok(true)
    }

    /// Seed a single-leaf tree holding one entry and record the new root
    pub(crate) fn start_new_tree(
        &self,
        root_write: &mut RootWriteGuard,
        key: K,
        rid: Rid,
    ) -> Result<(), BTreeError> {
        let (ptr, page_id) = self.buffer_pool.new_page()?;
        let mut guard = ptr.write_arc();

        let mut leaf = LeafPage::<K>::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(key, rid);
        leaf.encode(&mut guard);

        Self::finish_write(&self.buffer_pool, guard, true);
        **root_write = page_id;
        self.update_root_record(page_id)
    }

    /// Insert the separator for a freshly split pair into their parent,
    /// splitting upward as needed. Takes ownership of both children's write
    /// guards; they are released before any parent-level work that could
    /// touch their pages again.
    pub(crate) fn insert_into_parent(
        &self,
        ctx: &mut LatchContext<'_>,
        mut left_guard: PageWriteGuard,
        key: K,
        mut right_guard: PageWriteGuard,
    ) -> Result<(), BTreeError> {
        let left_page_id = left_guard.page_id;
        let right_page_id = right_guard.page_id;
        let parent_page_id = page::parent_page_id(&left_guard);

        if parent_page_id == INVALID_PAGE_ID {
            // The root split: grow the tree by one level
            let (root_ptr, root_page_id) = match self.buffer_pool.new_page() {
                Ok(pair) => pair,
                Err(e) => {
                    Self::finish_write(&self.buffer_pool, left_guard, true);
                    Self::finish_write(&self.buffer_pool, right_guard, true);
                    return Err(e.into());
                }
            };
            let mut root_guard = root_ptr.write_arc();

            let mut root =
                InternalPage::<K>::new(root_page_id, INVALID_PAGE_ID, self.internal_max_size);
            root.populate_new_root(left_page_id, key, right_page_id);
            root.encode(&mut root_guard);

            page::set_parent_page_id(&mut left_guard, root_page_id);
            page::set_parent_page_id(&mut right_guard, root_page_id);

            if let Some(root_write) = ctx.root_guard.as_mut() {
                **root_write = root_page_id;
            }

            Self::finish_write(&self.buffer_pool, left_guard, true);
            Self::finish_write(&self.buffer_pool, right_guard, true);
            Self::finish_write(&self.buffer_pool, root_guard, true);

            log::debug!("root split, tree height grew; new root {}", root_page_id);
            return self.update_root_record(root_page_id);
        }

        let mut parent_guard = ctx
            .pop()
            .expect("crabbing keeps the split page's parent latched");
        let mut parent = InternalPage::<K>::decode(&parent_guard);

        if parent
            .insert_after(left_page_id, key, right_page_id)
            .is_none()
        {
            Self::finish_write(&self.buffer_pool, left_guard, true);
            Self::finish_write(&self.buffer_pool, right_guard, true);
            Self::finish_write(&self.buffer_pool, parent_guard, false);
            ctx.release_all(false);
            return Err(BTreeError::ChildNotFound {
                parent: parent.page_id,
                child: left_page_id,
            });
        }

        // The children are consistent; release them before any further
        // parent-level restructuring can need to reach them again
        Self::finish_write(&self.buffer_pool, left_guard, true);
        Self::finish_write(&self.buffer_pool, right_guard, true);

        if parent.size() <= self.internal_max_size {
            parent.encode(&mut parent_guard);
            ctx.push(parent_guard);
            return Ok(());
        }

        // Parent overflowed: split it and recurse
        let (sibling_ptr, sibling_page_id) = match self.buffer_pool.new_page() {
            Ok(pair) => pair,
            Err(e) => {
                Self::finish_write(&self.buffer_pool, parent_guard, false);
                ctx.release_all(false);
                return Err(e.into());
            }
        };
        let mut sibling_guard = sibling_ptr.write_arc();
        let mut sibling =
            InternalPage::<K>::new(sibling_page_id, parent.parent_page_id, self.internal_max_size);
        parent.move_half_to(&mut sibling);
        let separator = sibling.key_at(0);

        parent.encode(&mut parent_guard);
        sibling.encode(&mut sibling_guard);
        log::debug!(
            "internal {} split, new sibling {}",
            parent.page_id,
            sibling_page_id
        );

        // Children that moved across now live under the sibling
        for &(_, child) in &sibling.entries {
            self.reparent(child, sibling_page_id)?;
        }

        self.insert_into_parent(ctx, parent_guard, separator, sibling_guard)
    }
}
