use std::collections::{HashMap, VecDeque};
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// LRU-K page replacement policy.
///
/// Frames with fewer than K recorded accesses live on the history list, the
/// rest on the cache list; both are kept most-recent-first. Eviction scans the
/// history list from its tail (the frame whose most recent access is oldest)
/// before ever considering the cache list, which is classical LRU-K with a
/// +infinity backward K-distance for under-sampled frames.
pub struct LruKReplacer {
    inner: Mutex<LruKInner>,
    k: usize,
    replacer_size: usize,
}

struct LruKInner {
    hist_list: VecDeque<FrameId>,
    cache_list: VecDeque<FrameId>,
    entries: HashMap<FrameId, FrameEntry>,
    curr_size: usize,
}

#[derive(Default)]
struct FrameEntry {
    hit_count: usize,
    evictable: bool,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        Self {
            inner: Mutex::new(LruKInner {
                hist_list: VecDeque::with_capacity(num_frames),
                cache_list: VecDeque::with_capacity(num_frames),
                entries: HashMap::with_capacity(num_frames),
                curr_size: 0,
            }),
            k,
            replacer_size: num_frames,
        }
    }

    /// Record an access to a frame, promoting it between lists as its hit
    /// count crosses K
    pub fn record_access(&self, frame_id: FrameId) {
        debug_assert!((frame_id as usize) < self.replacer_size, "frame id {} out of range", frame_id);

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let entry = inner.entries.entry(frame_id).or_default();
        entry.hit_count += 1;
        let count = entry.hit_count;

        if count == 1 {
            inner.hist_list.push_front(frame_id);
        } else if count == self.k {
            remove_from(&mut inner.hist_list, frame_id);
            inner.cache_list.push_front(frame_id);
        } else if count > self.k {
            remove_from(&mut inner.cache_list, frame_id);
            inner.cache_list.push_front(frame_id);
        }
        // 1 < count < k: position in the history list is unchanged; the
        // ordering key for under-sampled frames is their oldest access
    }

    /// Mark a frame evictable or pinned, adjusting the evictable count on
    /// transitions
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        debug_assert!((frame_id as usize) < self.replacer_size, "frame id {} out of range", frame_id);

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(entry) = inner.entries.get_mut(&frame_id) else {
            return;
        };

        if !entry.evictable && evictable {
            entry.evictable = true;
            inner.curr_size += 1;
        } else if entry.evictable && !evictable {
            entry.evictable = false;
            inner.curr_size -= 1;
        }
    }

    /// Choose and remove a victim: the oldest evictable history frame, then
    /// the oldest evictable cache frame
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        let victim = Self::scan_oldest_evictable(&inner.hist_list, &inner.entries)
            .or_else(|| Self::scan_oldest_evictable(&inner.cache_list, &inner.entries))?;

        remove_from(&mut inner.hist_list, victim);
        remove_from(&mut inner.cache_list, victim);
        inner.entries.remove(&victim);
        inner.curr_size -= 1;
        Some(victim)
    }

    /// Drop a specific frame from the replacer; false when the frame is
    /// unknown or still pinned
    pub fn remove(&self, frame_id: FrameId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(&frame_id) else {
            return false;
        };
        if !entry.evictable {
            log::warn!("attempted to remove non-evictable frame {}", frame_id);
            return false;
        }

        let under_sampled = entry.hit_count < self.k;
        if under_sampled {
            remove_from(&mut inner.hist_list, frame_id);
        } else {
            remove_from(&mut inner.cache_list, frame_id);
        }
        inner.entries.remove(&frame_id);
        inner.curr_size -= 1;
        true
    }

    /// Number of evictable frames
    pub fn size(&self) -> usize {
        self.inner.lock().curr_size
    }

    fn scan_oldest_evictable(
        list: &VecDeque<FrameId>,
        entries: &HashMap<FrameId, FrameEntry>,
    ) -> Option<FrameId> {
        // push_front on access keeps the oldest candidate at the back
        list.iter()
            .rev()
            .copied()
            .find(|id| entries.get(id).is_some_and(|e| e.evictable))
    }
}

fn remove_from(list: &mut VecDeque<FrameId>, frame_id: FrameId) {
    if let Some(pos) = list.iter().position(|&id| id == frame_id) {
        list.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_frame_evicted_before_cache_frame() {
        let replacer = LruKReplacer::new(8, 2);

        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);

        // Second access to frame 0 promotes it to the cache list
        replacer.record_access(0);

        // History frames 1 and 2 go first, oldest first; frame 0 last
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_pinned_frames_are_skipped() {
        let replacer = LruKReplacer::new(4, 2);

        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, false);
        replacer.set_evictable(1, true);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(0, true);
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_cache_list_ordered_by_kth_recency() {
        let replacer = LruKReplacer::new(4, 2);

        for frame in [0, 1] {
            replacer.record_access(frame);
            replacer.record_access(frame);
            replacer.set_evictable(frame, true);
        }
        // Refresh frame 0 so frame 1 becomes the colder cache entry
        replacer.record_access(0);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_size_tracks_evictable_transitions() {
        let replacer = LruKReplacer::new(4, 2);
        assert_eq!(replacer.size(), 0);

        replacer.record_access(0);
        replacer.record_access(1);
        assert_eq!(replacer.size(), 0);

        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);
        assert_eq!(replacer.size(), 2);

        // Repeated set is not double counted
        replacer.set_evictable(1, true);
        assert_eq!(replacer.size(), 2);

        replacer.set_evictable(0, false);
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_remove_refuses_pinned_frame() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        assert!(!replacer.remove(0));

        replacer.set_evictable(0, true);
        assert!(replacer.remove(0));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }
}
