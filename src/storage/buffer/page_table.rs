use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};

/// Extendible hash table: a dynamic-depth directory of shared buckets.
///
/// The buffer pool uses it as its page table (`page_id -> frame_id`); it is
/// generic so the container can be exercised on its own. All operations run
/// under a single table-level mutex; directory slots share buckets until a
/// split separates them.
pub struct ExtendibleHashTable<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    global_depth: usize,
    bucket_size: usize,
    num_buckets: usize,
    dir: Vec<Arc<RwLock<Bucket<K, V>>>>,
}

struct Bucket<K, V> {
    depth: usize,
    capacity: usize,
    items: Vec<(K, V)>,
}

impl<K, V> Bucket<K, V>
where
    K: PartialEq,
    V: Clone,
{
    fn new(capacity: usize, depth: usize) -> Self {
        Self {
            depth,
            capacity,
            items: Vec::with_capacity(capacity),
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    fn find(&self, key: &K) -> Option<V> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Overwrite on duplicate key; false when the bucket is full
    fn insert(&mut self, key: K, value: V) -> bool {
        if let Some(slot) = self.items.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.items.push((key, value));
        true
    }

    fn remove(&mut self, key: &K) -> bool {
        if let Some(pos) = self.items.iter().position(|(k, _)| k == key) {
            self.items.remove(pos);
            return true;
        }
        false
    }
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + PartialEq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        let bucket = Arc::new(RwLock::new(Bucket::new(bucket_size, 0)));
        Self {
            inner: Mutex::new(Inner {
                global_depth: 0,
                bucket_size,
                num_buckets: 1,
                dir: vec![bucket],
            }),
        }
    }

    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        self.inner.lock().dir[dir_index].read().depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let index = Self::index_of(key, inner.global_depth);
        let result = inner.dir[index].read().find(key);
        result
    }

    pub fn remove(&self, key: &K) -> bool {
        let inner = self.inner.lock();
        let index = Self::index_of(key, inner.global_depth);
        let result = inner.dir[index].write().remove(key);
        result
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let mut index = Self::index_of(&key, inner.global_depth);

        // A non-full target (or an overwrite of an existing key) needs no split
        if inner.dir[index].read().find(&key).is_some()
            || !inner.dir[index].read().is_full()
        {
            inner.dir[index].write().insert(key, value);
            return;
        }

        // Splitting may cascade: the overflowing entries can all land in the
        // same half, leaving the target full again
        while inner.dir[index].read().is_full() {
            let local_depth = inner.dir[index].read().depth;

            if local_depth == inner.global_depth {
                // Double the directory; copying the slots in order preserves
                // the low-order-bit correspondence
                let doubled: Vec<_> = inner.dir.iter().cloned().collect();
                inner.dir.extend(doubled);
                inner.global_depth += 1;
            }

            let bucket_size = inner.bucket_size;
            let zero_bucket = Arc::new(RwLock::new(Bucket::new(bucket_size, local_depth + 1)));
            let one_bucket = Arc::new(RwLock::new(Bucket::new(bucket_size, local_depth + 1)));

            // Redistribute by the bit that now distinguishes the two halves
            let local_mask = 1usize << local_depth;
            for (k, v) in inner.dir[index].read().items.iter() {
                if Self::hash_of(k) as usize & local_mask != 0 {
                    one_bucket.write().items.push((k.clone(), v.clone()));
                } else {
                    zero_bucket.write().items.push((k.clone(), v.clone()));
                }
            }

            // Repoint every directory slot that used to share the old bucket
            let start = Self::hash_of(&key) as usize & (local_mask - 1);
            let dir_len = inner.dir.len();
            let mut i = start;
            while i < dir_len {
                if i & local_mask != 0 {
                    inner.dir[i] = one_bucket.clone();
                } else {
                    inner.dir[i] = zero_bucket.clone();
                }
                i += local_mask;
            }

            inner.num_buckets += 1;
            index = Self::index_of(&key, inner.global_depth);
        }

        inner.dir[index].write().insert(key, value);
    }

    fn hash_of(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Directory slot for a key: the low `global_depth` bits of its hash
    fn index_of(key: &K, global_depth: usize) -> usize {
        let mask = (1usize << global_depth) - 1;
        Self::hash_of(key) as usize & mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_find() {
        let table = ExtendibleHashTable::<i32, String>::new(4);
        table.insert(1, "a".to_string());
        table.insert(2, "b".to_string());
        table.insert(3, "c".to_string());

        assert_eq!(table.find(&1), Some("a".to_string()));
        assert_eq!(table.find(&2), Some("b".to_string()));
        assert_eq!(table.find(&3), Some("c".to_string()));
        assert_eq!(table.find(&4), None);
    }

    #[test]
    fn test_insert_overwrites_existing_key() {
        let table = ExtendibleHashTable::<i32, i32>::new(2);
        table.insert(7, 70);
        table.insert(7, 71);
        assert_eq!(table.find(&7), Some(71));
    }

    #[test]
    fn test_remove() {
        let table = ExtendibleHashTable::<i32, i32>::new(4);
        table.insert(5, 50);
        assert!(table.remove(&5));
        assert_eq!(table.find(&5), None);
        assert!(!table.remove(&5));
    }

    #[test]
    fn test_split_grows_directory() {
        let table = ExtendibleHashTable::<i32, i32>::new(2);
        for key in 0..64 {
            table.insert(key, key * 10);
        }

        // Every entry must survive the cascade of splits
        for key in 0..64 {
            assert_eq!(table.find(&key), Some(key * 10), "key {} lost", key);
        }
        assert!(table.global_depth() > 0);
        assert!(table.num_buckets() > 1);
    }

    #[test]
    fn test_local_depth_bounded_by_global_depth() {
        let table = ExtendibleHashTable::<i32, i32>::new(2);
        for key in 0..32 {
            table.insert(key, key);
        }
        let global = table.global_depth();
        for i in 0..(1usize << global) {
            assert!(table.local_depth(i) <= global);
        }
    }

    #[test]
    fn test_mixed_workload() {
        let table = ExtendibleHashTable::<u64, u64>::new(3);
        for key in 0..200u64 {
            table.insert(key, key + 1000);
        }
        for key in (0..200u64).step_by(2) {
            assert!(table.remove(&key));
        }
        for key in 0..200u64 {
            if key % 2 == 0 {
                assert_eq!(table.find(&key), None);
            } else {
                assert_eq!(table.find(&key), Some(key + 1000));
            }
        }
    }
}
