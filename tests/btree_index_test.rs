use std::collections::BTreeMap;
use std::sync::Arc;
use anyhow::Result;
use rand::prelude::*;

use basaltdb::common::types::{PageId, Rid, INVALID_PAGE_ID};
use basaltdb::index::btree::page::BTreePage;
use basaltdb::{BPlusTree, BufferPoolManager};

mod common;
use common::{create_temp_db_file, create_test_buffer_pool};

fn rid_for(key: i64) -> Rid {
    Rid::new(key as u32, key as u32)
}

fn small_tree(pool_size: usize) -> Result<(BPlusTree<i64>, Arc<BufferPoolManager>, tempfile::NamedTempFile)> {
    let (buffer_pool, file) = create_test_buffer_pool(pool_size)?;
    let tree = BPlusTree::<i64>::new("test_index", buffer_pool.clone(), 4, 4)?;
    Ok((tree, buffer_pool, file))
}

/// Walk the whole tree verifying the structural invariants: in-page ordering,
/// separator bounds, size bounds for non-root pages, and parent pointers.
/// Returns the height of the subtree.
fn verify_subtree(
    buffer_pool: &Arc<BufferPoolManager>,
    page_id: PageId,
    parent: PageId,
    lower: Option<i64>,
    upper: Option<i64>,
) -> usize {
    let ptr = buffer_pool.fetch_page(page_id).unwrap();
    let node = {
        let guard = ptr.read();
        BTreePage::<i64>::decode(&guard).unwrap()
    };
    buffer_pool.unpin_page(page_id, false);

    let is_root = parent == INVALID_PAGE_ID;
    match node {
        BTreePage::Leaf(leaf) => {
            assert_eq!(leaf.parent_page_id, parent, "leaf {} parent", page_id);
            if !is_root {
                assert!(leaf.size() >= leaf.min_size(), "leaf {} underflow", page_id);
            }
            // Leaves never rest at max_size
            assert!(leaf.size() < leaf.max_size, "leaf {} overflow", page_id);

            let keys: Vec<i64> = leaf.entries.iter().map(|(k, _)| *k).collect();
            for window in keys.windows(2) {
                assert!(window[0] < window[1], "leaf {} keys out of order", page_id);
            }
            for key in &keys {
                if let Some(lo) = lower {
                    assert!(*key >= lo, "leaf {} key {} below bound {}", page_id, key, lo);
                }
                if let Some(hi) = upper {
                    assert!(*key < hi, "leaf {} key {} above bound {}", page_id, key, hi);
                }
            }
            1
        }
        BTreePage::Internal(internal) => {
            assert_eq!(internal.parent_page_id, parent, "internal {} parent", page_id);
            if is_root {
                assert!(internal.size() >= 2, "internal root {} too small", page_id);
            } else {
                assert!(internal.size() >= internal.min_size(), "internal {} underflow", page_id);
            }
            assert!(internal.size() <= internal.max_size, "internal {} overflow", page_id);

            for i in 2..internal.size() {
                assert!(
                    internal.key_at(i - 1) < internal.key_at(i),
                    "internal {} separators out of order",
                    page_id
                );
            }

            let mut heights = Vec::new();
            for i in 0..internal.size() {
                let child_lower = if i == 0 { lower } else { Some(internal.key_at(i)) };
                let child_upper = if i + 1 < internal.size() {
                    Some(internal.key_at(i + 1))
                } else {
                    upper
                };
                heights.push(verify_subtree(
                    buffer_pool,
                    internal.value_at(i),
                    page_id,
                    child_lower,
                    child_upper,
                ));
            }
            let first = heights[0];
            assert!(
                heights.iter().all(|h| *h == first),
                "internal {} children at unequal heights",
                page_id
            );
            first + 1
        }
    }
}

/// Check every invariant; returns the tree height (0 for an empty tree)
fn verify_tree(tree: &BPlusTree<i64>, buffer_pool: &Arc<BufferPoolManager>) -> usize {
    let root = tree.root_page_id();
    if root == INVALID_PAGE_ID {
        return 0;
    }
    verify_subtree(buffer_pool, root, INVALID_PAGE_ID, None, None)
}

#[test]
fn test_insert_and_get() -> Result<()> {
    let (tree, buffer_pool, _file) = small_tree(50)?;

    for key in 1..=10i64 {
        assert!(tree.insert(key, rid_for(key), None)?);
        verify_tree(&tree, &buffer_pool);
    }

    for key in 1..=10i64 {
        let mut result = Vec::new();
        assert!(tree.get(&key, &mut result)?, "key {} missing", key);
        assert_eq!(result, vec![rid_for(key)]);
    }

    let mut result = Vec::new();
    assert!(!tree.get(&42, &mut result)?);
    assert!(result.is_empty());
    Ok(())
}

#[test]
fn test_duplicate_insert_rejected() -> Result<()> {
    let (tree, buffer_pool, _file) = small_tree(50)?;

    for key in 1..=10i64 {
        tree.insert(key, rid_for(key), None)?;
    }
    let height_before = verify_tree(&tree, &buffer_pool);

    for key in 1..=10i64 {
        assert!(!tree.insert(key, rid_for(key + 100), None)?);
    }
    assert_eq!(verify_tree(&tree, &buffer_pool), height_before);

    // Original values are untouched
    for key in 1..=10i64 {
        let mut result = Vec::new();
        tree.get(&key, &mut result)?;
        assert_eq!(result, vec![rid_for(key)]);
    }
    Ok(())
}

#[test]
fn test_split_cascade_grows_height() -> Result<()> {
    let (tree, buffer_pool, _file) = small_tree(50)?;

    // With fan-out 4 the first split happens on the 4th insert and the tree
    // keeps deepening as more leaves fill
    tree.insert(1, rid_for(1), None)?;
    assert_eq!(verify_tree(&tree, &buffer_pool), 1);

    for key in 2..=30i64 {
        tree.insert(key, rid_for(key), None)?;
        verify_tree(&tree, &buffer_pool);
    }
    assert!(verify_tree(&tree, &buffer_pool) >= 3);
    Ok(())
}

#[test]
fn test_remove_merges_and_shrinks_height() -> Result<()> {
    let (tree, buffer_pool, _file) = small_tree(50)?;

    for key in 1..=10i64 {
        tree.insert(key, rid_for(key), None)?;
    }
    let height_full = verify_tree(&tree, &buffer_pool);
    assert!(height_full >= 2);

    for key in 1..=8i64 {
        tree.remove(&key, None)?;
        verify_tree(&tree, &buffer_pool);
        let mut result = Vec::new();
        assert!(!tree.get(&key, &mut result)?);
    }

    // Two keys left: everything fits in a single leaf again
    assert_eq!(verify_tree(&tree, &buffer_pool), 1);
    for key in 9..=10i64 {
        let mut result = Vec::new();
        assert!(tree.get(&key, &mut result)?);
    }
    Ok(())
}

#[test]
fn test_remove_everything_empties_tree() -> Result<()> {
    let (tree, buffer_pool, _file) = small_tree(50)?;

    for key in 1..=20i64 {
        tree.insert(key, rid_for(key), None)?;
    }
    for key in 1..=20i64 {
        tree.remove(&key, None)?;
        verify_tree(&tree, &buffer_pool);
    }

    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);

    // Removing from an empty tree is a no-op; re-inserting works
    tree.remove(&1, None)?;
    assert!(tree.insert(5, rid_for(5), None)?);
    let mut result = Vec::new();
    assert!(tree.get(&5, &mut result)?);
    Ok(())
}

#[test]
fn test_iterator_full_scan() -> Result<()> {
    let (tree, _buffer_pool, _file) = small_tree(80)?;

    let mut keys: Vec<i64> = (1..=200).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(7));
    for key in &keys {
        tree.insert(*key, rid_for(*key), None)?;
    }

    let collected: Vec<i64> = tree.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = (1..=200).collect();
    assert_eq!(collected, expected);
    Ok(())
}

#[test]
fn test_iterator_from_key() -> Result<()> {
    let (tree, _buffer_pool, _file) = small_tree(50)?;

    for key in (2..=40i64).step_by(2) {
        tree.insert(key, rid_for(key), None)?;
    }

    // Exact hit
    let from_10: Vec<i64> = tree.iter_from(&10)?.map(|(k, _)| k).collect();
    assert_eq!(from_10, (10..=40).step_by(2).collect::<Vec<i64>>());

    // Between keys: starts at the next larger one
    let from_11: Vec<i64> = tree.iter_from(&11)?.map(|(k, _)| k).collect();
    assert_eq!(from_11, (12..=40).step_by(2).collect::<Vec<i64>>());

    // Past the last key: immediately the end sentinel
    let mut past_end = tree.iter_from(&100)?;
    assert!(past_end.next().is_none());
    assert!(past_end.is_end());
    Ok(())
}

#[test]
fn test_iterator_end_position() -> Result<()> {
    let (tree, _buffer_pool, _file) = small_tree(50)?;

    for key in 1..=25i64 {
        tree.insert(key, rid_for(key), None)?;
    }

    let end = tree.end_position()?;
    let mut iter = tree.iter()?;
    while iter.next().is_some() {}
    assert!(iter.is_end());
    assert_eq!(iter.position(), end);
    Ok(())
}

#[test]
fn test_empty_tree_behaviour() -> Result<()> {
    let (tree, buffer_pool, _file) = small_tree(20)?;

    assert!(tree.is_empty());
    assert_eq!(verify_tree(&tree, &buffer_pool), 0);

    let mut result = Vec::new();
    assert!(!tree.get(&1, &mut result)?);
    tree.remove(&1, None)?;

    let mut iter = tree.iter()?;
    assert!(iter.is_end());
    assert!(iter.next().is_none());
    assert_eq!(iter.position(), (INVALID_PAGE_ID, 0));
    assert_eq!(tree.end_position()?, (INVALID_PAGE_ID, 0));
    Ok(())
}

#[test]
fn test_random_workload_against_oracle() -> Result<()> {
    let (tree, buffer_pool, _file) = small_tree(100)?;
    let mut oracle = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(42);

    for round in 0..600 {
        let key = rng.gen_range(0..120i64);
        if rng.gen_bool(0.6) {
            let inserted = tree.insert(key, rid_for(key), None)?;
            let expected = oracle.insert(key, rid_for(key)).is_none();
            assert_eq!(inserted, expected, "insert {} at round {}", key, round);
        } else {
            tree.remove(&key, None)?;
            oracle.remove(&key);
        }
        if round % 50 == 0 {
            verify_tree(&tree, &buffer_pool);
        }
    }
    verify_tree(&tree, &buffer_pool);

    for key in 0..120i64 {
        let mut result = Vec::new();
        let found = tree.get(&key, &mut result)?;
        assert_eq!(found, oracle.contains_key(&key), "key {}", key);
    }

    let scanned: Vec<i64> = tree.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = oracle.keys().copied().collect();
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn test_concurrent_inserts() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(200)?;
    let tree = Arc::new(BPlusTree::<i64>::new("concurrent", buffer_pool.clone(), 4, 4)?);

    let mut handles = Vec::new();
    for worker in 0..4i64 {
        let tree = tree.clone();
        handles.push(std::thread::spawn(move || {
            for key in (worker * 100)..(worker * 100 + 100) {
                tree.insert(key, rid_for(key), None).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    verify_tree(&tree, &buffer_pool);
    for key in 0..400i64 {
        let mut result = Vec::new();
        assert!(tree.get(&key, &mut result)?, "key {} missing", key);
    }

    let scanned: Vec<i64> = tree.iter()?.map(|(k, _)| k).collect();
    assert_eq!(scanned, (0..400).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn test_concurrent_mixed_workload() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(200)?;
    let tree = Arc::new(BPlusTree::<i64>::new("mixed", buffer_pool.clone(), 4, 4)?);

    for key in 0..200i64 {
        tree.insert(key, rid_for(key), None)?;
    }

    // Writers delete even keys while readers scan concurrently
    let mut handles = Vec::new();
    for worker in 0..2i64 {
        let tree = tree.clone();
        handles.push(std::thread::spawn(move || {
            for key in ((worker * 100)..(worker * 100 + 100)).filter(|k| k % 2 == 0) {
                tree.remove(&key, None).unwrap();
            }
        }));
    }
    for _ in 0..2 {
        let tree = tree.clone();
        handles.push(std::thread::spawn(move || {
            for probe in (1..200i64).step_by(2) {
                let mut result = Vec::new();
                // Odd keys are never deleted
                assert!(tree.get(&probe, &mut result).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    verify_tree(&tree, &buffer_pool);
    let scanned: Vec<i64> = tree.iter()?.map(|(k, _)| k).collect();
    assert_eq!(scanned, (1..200).step_by(2).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn test_persistence_across_reopen() -> Result<()> {
    let (file, path) = create_temp_db_file()?;

    {
        let buffer_pool = Arc::new(BufferPoolManager::new(50, &path, 2)?);
        let tree = BPlusTree::<i64>::new("persisted", buffer_pool.clone(), 4, 4)?;
        for key in 1..=60i64 {
            tree.insert(key, rid_for(key), None)?;
        }
        buffer_pool.flush_all_pages()?;
    }

    // A fresh pool and tree instance find the root through the header page
    let buffer_pool = Arc::new(BufferPoolManager::new(50, &path, 2)?);
    let tree = BPlusTree::<i64>::new("persisted", buffer_pool.clone(), 4, 4)?;
    assert!(!tree.is_empty());

    for key in 1..=60i64 {
        let mut result = Vec::new();
        assert!(tree.get(&key, &mut result)?, "key {} lost", key);
        assert_eq!(result, vec![rid_for(key)]);
    }
    verify_tree(&tree, &buffer_pool);

    drop(file);
    Ok(())
}

#[test]
fn test_two_indexes_share_header_page() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(60)?;

    let first = BPlusTree::<i64>::new("first", buffer_pool.clone(), 4, 4)?;
    let second = BPlusTree::<i64>::new("second", buffer_pool.clone(), 4, 4)?;

    for key in 1..=20i64 {
        first.insert(key, rid_for(key), None)?;
        second.insert(-key, rid_for(key), None)?;
    }

    assert_ne!(first.root_page_id(), second.root_page_id());

    let mut result = Vec::new();
    assert!(first.get(&5, &mut result)?);
    assert!(!second.get(&5, &mut result)?);
    assert!(second.get(&-5, &mut result)?);
    Ok(())
}

#[test]
fn test_dumpers_render() -> Result<()> {
    let (tree, _buffer_pool, _file) = small_tree(50)?;
    for key in 1..=12i64 {
        tree.insert(key, rid_for(key), None)?;
    }

    let text = tree.dump()?;
    assert!(text.contains("internal"));
    assert!(text.contains("leaf"));

    let dot = tree.to_dot()?;
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("->"));
    Ok(())
}
