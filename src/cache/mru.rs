//! MRU residency tracker for box payloads
//!
//! Tracks which boxes' payloads are memory-resident, in most-recently-used
//! order, plus the pending-write buffer of dirty boxes. The cache holds box
//! ids and costs only, never the boxes themselves, so destroying a tree
//! needs no coordination with the cache.
//!
//! The recency order is a doubly-linked list threaded through a hash map
//! (`prev`/`next` are box ids), so `touch`, insertion, and removal are all
//! O(1). Costs are abstract units supplied by each box (event counts), not
//! bytes, which keeps the accounting generic over dimensionality.
//!
//! # Eviction invariants
//!
//! 1. A box in the pending-write buffer is never an eviction victim;
//!    dirty payload must be flushed before its memory can be released.
//! 2. The cache mutates nothing but its own bookkeeping; actual save and
//!    release go through the engine, which owns the nodes.

use crate::error::BoxId;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
struct Entry {
    cost: u64,
    dirty: bool,
    prev: Option<BoxId>,
    next: Option<BoxId>,
}

/// Residency bookkeeping for all boxes of one dataset
#[derive(Debug, Default)]
pub struct MruCache {
    entries: HashMap<BoxId, Entry>,
    /// Most recently used
    head: Option<BoxId>,
    /// Least recently used
    tail: Option<BoxId>,
    resident_cost: u64,
    pending: HashSet<BoxId>,
    pending_cost: u64,
}

impl MruCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a box as resident with the given cost, as most recent
    ///
    /// No-op (besides a touch) if the box is already tracked.
    pub fn insert(&mut self, id: BoxId, cost: u64) {
        if self.entries.contains_key(&id) {
            self.touch(id);
            self.set_cost(id, cost);
            return;
        }
        self.entries.insert(
            id,
            Entry {
                cost,
                dirty: false,
                prev: None,
                next: None,
            },
        );
        self.resident_cost += cost;
        self.link_front(id);
    }

    /// Mark a box most-recently-used
    pub fn touch(&mut self, id: BoxId) {
        if self.entries.contains_key(&id) && self.head != Some(id) {
            self.unlink(id);
            self.link_front(id);
        }
    }

    /// Whether the box's payload is tracked as resident
    pub fn contains(&self, id: BoxId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Update a box's cost after its payload changed size
    pub fn set_cost(&mut self, id: BoxId, cost: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            let old = entry.cost;
            entry.cost = cost;
            self.resident_cost = self.resident_cost - old + cost;
            if entry.dirty {
                self.pending_cost = self.pending_cost - old + cost;
            }
        }
    }

    /// Move a box into the pending-write buffer
    pub fn mark_dirty(&mut self, id: BoxId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if !entry.dirty {
                entry.dirty = true;
                self.pending.insert(id);
                self.pending_cost += entry.cost;
            }
        }
    }

    /// Whether the box awaits a write
    pub fn is_dirty(&self, id: BoxId) -> bool {
        self.entries.get(&id).map(|e| e.dirty).unwrap_or(false)
    }

    /// Ids currently in the pending-write buffer, unordered
    ///
    /// The caller sorts them by file position before writing, and clears
    /// each box with `clear_dirty` only after its write succeeds, so a
    /// failed flush leaves every unwritten box pinned.
    pub fn pending_ids(&self) -> Vec<BoxId> {
        self.pending.iter().copied().collect()
    }

    /// Mark one box's payload as written; it leaves the pending buffer
    pub fn clear_dirty(&mut self, id: BoxId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.dirty {
                entry.dirty = false;
                self.pending.remove(&id);
                self.pending_cost -= entry.cost;
            }
        }
    }

    /// Drop a box from the cache entirely (eviction, or leaf-to-grid split)
    ///
    /// Returns the cost that was accounted to it.
    pub fn remove(&mut self, id: BoxId) -> Option<u64> {
        if !self.entries.contains_key(&id) {
            return None;
        }
        self.unlink(id);
        let entry = self.entries.remove(&id)?;
        self.resident_cost -= entry.cost;
        if entry.dirty {
            self.pending.remove(&id);
            self.pending_cost -= entry.cost;
        }
        Some(entry.cost)
    }

    /// Least-recently-used resident box that is clean and not `protect`
    ///
    /// Dirty boxes are skipped: they are pinned by the pending-write
    /// buffer until flushed.
    pub fn lru_clean_victim(&self, protect: Option<BoxId>) -> Option<BoxId> {
        let mut cursor = self.tail;
        while let Some(id) = cursor {
            let entry = self.entries.get(&id)?;
            if !entry.dirty && Some(id) != protect {
                return Some(id);
            }
            cursor = entry.prev;
        }
        None
    }

    /// Total cost of resident payloads
    pub fn resident_cost(&self) -> u64 {
        self.resident_cost
    }

    /// Total cost awaiting a coalesced write
    pub fn pending_cost(&self) -> u64 {
        self.pending_cost
    }

    /// Number of boxes awaiting a write
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of resident boxes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn link_front(&mut self, id: BoxId) {
        let old_head = self.head;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(entry) = old_head.and_then(|h| self.entries.get_mut(&h)) {
            entry.prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn unlink(&mut self, id: BoxId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let (prev, next) = (entry.prev, entry.next);
        match prev.and_then(|p| self.entries.get_mut(&p)) {
            Some(entry) => entry.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.entries.get_mut(&n)) {
            Some(entry) => entry.prev = prev,
            None => self.tail = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lru_order(cache: &MruCache) -> Vec<BoxId> {
        // head (MRU) to tail (LRU)
        let mut order = Vec::new();
        let mut cursor = cache.head;
        while let Some(id) = cursor {
            order.push(id);
            cursor = cache.entries[&id].next;
        }
        order
    }

    #[test]
    fn test_insert_and_touch_order() {
        let mut cache = MruCache::new();
        cache.insert(1, 1);
        cache.insert(2, 1);
        cache.insert(3, 1);
        assert_eq!(lru_order(&cache), vec![3, 2, 1]);

        cache.touch(1);
        assert_eq!(lru_order(&cache), vec![1, 3, 2]);

        cache.touch(1); // already at head
        assert_eq!(lru_order(&cache), vec![1, 3, 2]);
    }

    #[test]
    fn test_lru_victim_scenario() {
        // Budget 3, unit costs, touched A,B,C,D: A must be the victim
        let (a, b, c, d) = (10, 11, 12, 13);
        let mut cache = MruCache::new();
        for id in [a, b, c, d] {
            cache.insert(id, 1);
        }
        assert_eq!(cache.resident_cost(), 4);

        let victim = cache.lru_clean_victim(None).unwrap();
        assert_eq!(victim, a);

        cache.remove(victim);
        assert_eq!(cache.resident_cost(), 3);
        assert!(!cache.contains(a));
        assert!(cache.contains(b) && cache.contains(c) && cache.contains(d));
    }

    #[test]
    fn test_dirty_boxes_are_not_victims() {
        let mut cache = MruCache::new();
        cache.insert(1, 1);
        cache.insert(2, 1);
        cache.mark_dirty(1);

        // 1 is LRU but dirty; 2 is the only eligible victim
        assert_eq!(cache.lru_clean_victim(None), Some(2));

        cache.mark_dirty(2);
        assert_eq!(cache.lru_clean_victim(None), None);

        cache.clear_dirty(1);
        cache.clear_dirty(2);
        assert_eq!(cache.lru_clean_victim(None), Some(1));
    }

    #[test]
    fn test_protect_skipped() {
        let mut cache = MruCache::new();
        cache.insert(1, 1);
        assert_eq!(cache.lru_clean_victim(Some(1)), None);
    }

    #[test]
    fn test_pending_accounting() {
        let mut cache = MruCache::new();
        cache.insert(1, 5);
        cache.insert(2, 3);
        cache.mark_dirty(1);
        cache.mark_dirty(1); // idempotent
        cache.mark_dirty(2);

        assert_eq!(cache.pending_len(), 2);
        assert_eq!(cache.pending_cost(), 8);

        cache.set_cost(1, 7);
        assert_eq!(cache.pending_cost(), 10);
        assert_eq!(cache.resident_cost(), 10);

        let mut pending = cache.pending_ids();
        pending.sort_unstable();
        assert_eq!(pending, vec![1, 2]);

        cache.clear_dirty(1);
        cache.clear_dirty(2);
        assert_eq!(cache.pending_cost(), 0);
        assert!(!cache.is_dirty(1));
        // still resident after flush
        assert_eq!(cache.resident_cost(), 10);
    }

    #[test]
    fn test_unwritten_boxes_stay_pinned_after_aborted_flush() {
        let mut cache = MruCache::new();
        cache.insert(1, 2);
        cache.insert(2, 3);
        cache.mark_dirty(1);
        cache.mark_dirty(2);

        // first write lands, then the flush aborts: only box 1 is cleared
        cache.clear_dirty(1);

        // the unwritten box keeps its pin; only the written one is a victim
        assert!(cache.is_dirty(2));
        assert_eq!(cache.lru_clean_victim(None), Some(1));
        assert_eq!(cache.pending_cost(), 3);
        assert_eq!(cache.pending_ids(), vec![2]);
    }

    #[test]
    fn test_remove_dirty_clears_pending() {
        let mut cache = MruCache::new();
        cache.insert(1, 4);
        cache.mark_dirty(1);

        assert_eq!(cache.remove(1), Some(4));
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.pending_cost(), 0);
        assert_eq!(cache.resident_cost(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reinsert_updates_cost() {
        let mut cache = MruCache::new();
        cache.insert(1, 4);
        cache.insert(2, 1);
        cache.insert(1, 6); // re-insert acts as touch + cost update

        assert_eq!(cache.resident_cost(), 7);
        assert_eq!(lru_order(&cache), vec![1, 2]);
    }
}
