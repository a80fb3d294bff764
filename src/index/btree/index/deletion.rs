use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::{BTreePage, InternalPage, LeafPage};
use crate::transaction::concurrency::transaction::Transaction;

use super::base::{AccessMode, BPlusTree, LatchContext, PageWriteGuard};

impl<K: IndexKey> BPlusTree<K> {
    /// Remove a key; absent keys are a no-op.
    ///
    /// A leaf that would underflow restarts the operation as a pessimistic
    /// pass, which rebalances bottom-up by redistribution or coalescing.
    /// Pages emptied by coalescing are deallocated only after every latch is
    /// released.
    pub fn remove(&self, key: &K, txn: Option<&Transaction>) -> Result<(), BTreeError> {
        // Optimistic pass
        let Some(mut guard) = self.find_leaf_write(key)? else {
            return Ok(());
        };

        let mut leaf = LeafPage::<K>::decode(&guard);
        if leaf.lookup(key).is_none() {
            Self::finish_write(&self.buffer_pool, guard, false);
            return Ok(());
        }

        let is_root = leaf.parent_page_id == INVALID_PAGE_ID;
        let safe = if is_root {
            leaf.size() > 1
        } else {
            leaf.size() > leaf.min_size()
        };
        if safe {
            leaf.remove(key);
            leaf.encode(&mut guard);
            Self::finish_write(&self.buffer_pool, guard, true);
            return Ok(());
        }

        Self::finish_write(&self.buffer_pool, guard, false);
        self.remove_pessimistic(key, txn)
    }

    fn remove_pessimistic(&self, key: &K, txn: Option<&Transaction>) -> Result<(), BTreeError> {
        let mut ctx = LatchContext::new(&self.buffer_pool);
        let root_write = self.root_page_id.write_arc();
        if *root_write == INVALID_PAGE_ID {
            return Ok(());
        }
        ctx.root_guard = Some(root_write);

        self.find_leaf_pessimistic(key, AccessMode::Delete, &mut ctx)?;
        let mut leaf_guard = ctx
            .pop()
            .expect("pessimistic descent leaves the target leaf on the stack");
        let mut leaf = LeafPage::<K>::decode(&leaf_guard);

        let before = leaf.size();
        leaf.remove(key);
        if leaf.size() == before {
            Self::finish_write(&self.buffer_pool, leaf_guard, false);
            ctx.release_all(false);
            return Ok(());
        }

        let mut deleted = Vec::new();
        self.rebalance(&mut ctx, BTreePage::Leaf(leaf), leaf_guard, &mut deleted)?;
        ctx.release_all(true);

        // Deallocate outside the latches; a page pinned by a straggling
        // reader is simply left to the pool
        if let Some(txn) = txn {
            txn.add_deleted_pages(&deleted);
            deleted = txn.take_deleted_pages();
        }
        for page_id in deleted {
            if let Err(e) = self.buffer_pool.delete_page(page_id) {
                log::debug!("deferred delete of page {} failed: {}", page_id, e);
            }
        }
        Ok(())
    }

    /// Restore the size invariant on `node` after a deletion, recursing up
    /// the retained latch stack as merges remove separators from parents.
    /// Consumes the node's guard; the decoded (already modified) node is
    /// written back through it.
    fn rebalance(
        &self,
        ctx: &mut LatchContext<'_>,
        mut node: BTreePage<K>,
        mut node_guard: PageWriteGuard,
        deleted: &mut Vec<PageId>,
    ) -> Result<(), BTreeError> {
        if node.parent_page_id() == INVALID_PAGE_ID {
            return self.adjust_root(ctx, node, node_guard, deleted);
        }

        if node.size() >= node.min_size() {
            node.encode(&mut node_guard);
            Self::finish_write(&self.buffer_pool, node_guard, true);
            return Ok(());
        }

        let mut parent_guard = ctx
            .pop()
            .expect("crabbing keeps the parent of an underflowing page latched");
        let mut parent = InternalPage::<K>::decode(&parent_guard);

        let Some(index) = parent.value_index(node.page_id()) else {
            Self::finish_write(&self.buffer_pool, node_guard, false);
            Self::finish_write(&self.buffer_pool, parent_guard, false);
            ctx.release_all(false);
            return Err(BTreeError::ChildNotFound {
                parent: parent.page_id,
                child: node.page_id(),
            });
        };

        // The first child borrows from its right neighbour, everyone else
        // from the left
        let sibling_index = if index == 0 { 1 } else { index - 1 };
        let sibling_page_id = parent.value_at(sibling_index);
        let sibling_ptr = match self.buffer_pool.fetch_page(sibling_page_id) {
            Ok(ptr) => ptr,
            Err(e) => {
                Self::finish_write(&self.buffer_pool, node_guard, false);
                Self::finish_write(&self.buffer_pool, parent_guard, false);
                ctx.release_all(false);
                return Err(e.into());
            }
        };
        let mut sibling_guard = sibling_ptr.write_arc();
        let mut sibling = match BTreePage::<K>::decode(&sibling_guard) {
            Ok(page) => page,
            Err(e) => {
                Self::finish_write(&self.buffer_pool, node_guard, false);
                Self::finish_write(&self.buffer_pool, sibling_guard, false);
                Self::finish_write(&self.buffer_pool, parent_guard, false);
                ctx.release_all(false);
                return Err(e);
            }
        };

        if node.size() + sibling.size() >= node.max_size() {
            // Redistribute a single entry across the boundary
            self.redistribute(&mut sibling, &mut node, &mut parent, index)?;

            node.encode(&mut node_guard);
            sibling.encode(&mut sibling_guard);
            parent.encode(&mut parent_guard);

            Self::finish_write(&self.buffer_pool, node_guard, true);
            Self::finish_write(&self.buffer_pool, sibling_guard, true);
            ctx.push(parent_guard);
            return Ok(());
        }

        // Coalesce: append the right page into the left one and drop the
        // separator from the parent
        let (mut left, mut left_guard, mut right, mut right_guard, separator_index) = if index == 0
        {
            (node, node_guard, sibling, sibling_guard, 1)
        } else {
            (sibling, sibling_guard, node, node_guard, index)
        };

        match (&mut left, &mut right) {
            (BTreePage::Leaf(left_leaf), BTreePage::Leaf(right_leaf)) => {
                right_leaf.move_all_to(left_leaf);
            }
            (BTreePage::Internal(left_internal), BTreePage::Internal(right_internal)) => {
                let moved: Vec<PageId> =
                    right_internal.entries.iter().map(|(_, v)| *v).collect();
                let middle_key = parent.key_at(separator_index);
                right_internal.move_all_to(left_internal, middle_key);
                for child in moved {
                    self.reparent(child, left_internal.page_id)?;
                }
            }
            _ => {
                Self::finish_write(&self.buffer_pool, left_guard, false);
                Self::finish_write(&self.buffer_pool, right_guard, false);
                Self::finish_write(&self.buffer_pool, parent_guard, false);
                ctx.release_all(false);
                return Err(BTreeError::InvalidPageType(sibling_page_id));
            }
        }

        log::debug!(
            "coalesced page {} into {}",
            right.page_id(),
            left.page_id()
        );
        deleted.push(right.page_id());

        // The emptied right page keeps a consistent husk on disk until it is
        // deallocated, so a chained reader passing through sees zero entries
        left.encode(&mut left_guard);
        right.encode(&mut right_guard);
        Self::finish_write(&self.buffer_pool, left_guard, true);
        Self::finish_write(&self.buffer_pool, right_guard, true);

        parent.remove(separator_index);
        self.rebalance(ctx, BTreePage::Internal(parent), parent_guard, deleted)
    }

    /// Move one entry between `node` and its sibling and fix the separator.
    /// `index` is the node's position in the parent; index 0 means the
    /// sibling is the right neighbour.
    fn redistribute(
        &self,
        sibling: &mut BTreePage<K>,
        node: &mut BTreePage<K>,
        parent: &mut InternalPage<K>,
        index: usize,
    ) -> Result<(), BTreeError> {
        match (sibling, node) {
            (BTreePage::Leaf(sibling_leaf), BTreePage::Leaf(node_leaf)) => {
                if index == 0 {
                    sibling_leaf.move_first_to_end(node_leaf);
                    parent.set_key_at(1, sibling_leaf.key_at(0));
                } else {
                    sibling_leaf.move_last_to_front(node_leaf);
                    parent.set_key_at(index, node_leaf.key_at(0));
                }
                Ok(())
            }
            (BTreePage::Internal(sibling_internal), BTreePage::Internal(node_internal)) => {
                if index == 0 {
                    let middle_key = parent.key_at(1);
                    sibling_internal.move_first_to_end(node_internal, middle_key);
                    parent.set_key_at(1, sibling_internal.key_at(0));
                    let moved = node_internal.value_at(node_internal.size() - 1);
                    self.reparent(moved, node_internal.page_id)?;
                } else {
                    let middle_key = parent.key_at(index);
                    sibling_internal.move_last_to_front(node_internal, middle_key);
                    parent.set_key_at(index, node_internal.key_at(0));
                    let moved = node_internal.value_at(0);
                    self.reparent(moved, node_internal.page_id)?;
                }
                Ok(())
            }
            (sibling, _) => Err(BTreeError::InvalidPageType(sibling.page_id())),
        }
    }

    /// Root-specific rebalancing: promote the only child of a shrunken
    /// internal root, or empty the tree when the root leaf drains
    fn adjust_root(
        &self,
        ctx: &mut LatchContext<'_>,
        node: BTreePage<K>,
        mut node_guard: PageWriteGuard,
        deleted: &mut Vec<PageId>,
    ) -> Result<(), BTreeError> {
        match &node {
            BTreePage::Internal(root) if root.size() == 1 => {
                let child = root.value_at(0);
                deleted.push(root.page_id);
                Self::finish_write(&self.buffer_pool, node_guard, true);

                self.reparent(child, INVALID_PAGE_ID)?;
                if let Some(root_write) = ctx.root_guard.as_mut() {
                    **root_write = child;
                }
                log::debug!("root collapsed, tree height shrank; new root {}", child);
                self.update_root_record(child)
            }
            BTreePage::Leaf(root) if root.size() == 0 => {
                deleted.push(root.page_id);
                Self::finish_write(&self.buffer_pool, node_guard, true);

                if let Some(root_write) = ctx.root_guard.as_mut() {
                    **root_write = INVALID_PAGE_ID;
                }
                log::debug!("last entry removed, tree is empty");
                self.update_root_record(INVALID_PAGE_ID)
            }
            _ => {
                node.encode(&mut node_guard);
                Self::finish_write(&self.buffer_pool, node_guard, true);
                Ok(())
            }
        }
    }
}
