//! The set of instances enlisted in the current transaction
//!
//! Two partitions, clean and dirty. An instance is in at most one of them.
//! Each partition remembers insertion order so flushes can run in the order
//! instances were first dirtied, and so the clean partition can shed its
//! oldest entries when a capacity is configured.

use persista_core::InstanceId;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
struct Partition {
    seq: u64,
    order: BTreeMap<u64, InstanceId>,
    index: FxHashMap<InstanceId, u64>,
}

impl Partition {
    fn insert(&mut self, id: InstanceId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        self.seq += 1;
        self.order.insert(self.seq, id);
        self.index.insert(id, self.seq);
        true
    }

    fn remove(&mut self, id: InstanceId) -> bool {
        match self.index.remove(&id) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn contains(&self, id: InstanceId) -> bool {
        self.index.contains_key(&id)
    }

    fn ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.order.values().copied()
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }
}

/// Clean and dirty transactional instances
#[derive(Debug, Default, Clone)]
pub struct TransactionalSet {
    clean: Partition,
    dirty: Partition,
    capacity: Option<usize>,
}

impl TransactionalSet {
    /// Unbounded set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whose clean partition holds at most `capacity` entries
    pub fn with_clean_capacity(capacity: Option<usize>) -> Self {
        TransactionalSet {
            capacity,
            ..Self::default()
        }
    }

    /// Change the clean partition bound; takes effect at the next `overflow`
    pub fn set_clean_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    /// Enlist as clean, moving out of the dirty partition if needed
    ///
    /// Returns whether the set changed.
    pub fn add_clean(&mut self, id: InstanceId) -> bool {
        let moved = self.dirty.remove(id);
        self.clean.insert(id) || moved
    }

    /// Enlist as dirty, moving out of the clean partition if needed
    pub fn add_dirty(&mut self, id: InstanceId) -> bool {
        let moved = self.clean.remove(id);
        self.dirty.insert(id) || moved
    }

    /// Delist from either partition
    pub fn remove(&mut self, id: InstanceId) -> bool {
        self.clean.remove(id) || self.dirty.remove(id)
    }

    /// Move every dirty instance to the clean partition after a flush
    pub fn flushed(&mut self) {
        let dirty: Vec<_> = self.dirty.ids().collect();
        self.dirty.clear();
        for id in dirty {
            self.clean.insert(id);
        }
    }

    /// Every instance, dirty first, each partition in insertion order
    pub fn copy(&self) -> Vec<InstanceId> {
        self.dirty.ids().chain(self.clean.ids()).collect()
    }

    /// Dirty instances in the order they were dirtied
    pub fn copy_dirty(&self) -> Vec<InstanceId> {
        self.dirty.ids().collect()
    }

    /// Whether `id` is enlisted
    pub fn contains(&self, id: InstanceId) -> bool {
        self.clean.contains(id) || self.dirty.contains(id)
    }

    /// Whether `id` is in the dirty partition
    pub fn is_dirty(&self, id: InstanceId) -> bool {
        self.dirty.contains(id)
    }

    /// Whether nothing is enlisted
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of enlisted instances
    pub fn size(&self) -> usize {
        self.clean.len() + self.dirty.len()
    }

    /// Delist everything, keeping the backing maps for the next transaction
    pub fn clear(&mut self) {
        self.clean.clear();
        self.dirty.clear();
    }

    /// Oldest clean entries beyond the configured capacity
    ///
    /// The entries stay enlisted; the caller decides which of them may
    /// leave the transaction.
    pub fn overflow(&self) -> Vec<InstanceId> {
        match self.capacity {
            Some(cap) if self.clean.len() > cap => {
                self.clean.ids().take(self.clean.len() - cap).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u64) -> InstanceId {
        InstanceId::new(n)
    }

    #[test]
    fn test_partitions_are_exclusive() {
        let mut set = TransactionalSet::new();
        assert!(set.add_clean(id(1)));
        assert!(set.add_dirty(id(1)));
        assert!(set.is_dirty(id(1)));
        assert_eq!(set.size(), 1);
        assert!(!set.add_dirty(id(1)));
    }

    #[test]
    fn test_copy_orders_dirty_first() {
        let mut set = TransactionalSet::new();
        set.add_clean(id(1));
        set.add_dirty(id(3));
        set.add_dirty(id(2));
        assert_eq!(set.copy(), vec![id(3), id(2), id(1)]);
        assert_eq!(set.copy_dirty(), vec![id(3), id(2)]);
    }

    #[test]
    fn test_flushed_moves_to_clean() {
        let mut set = TransactionalSet::new();
        set.add_dirty(id(1));
        set.add_dirty(id(2));
        set.flushed();
        assert!(set.copy_dirty().is_empty());
        assert_eq!(set.size(), 2);
    }

    #[test]
    fn test_overflow_reports_oldest_clean() {
        let mut set = TransactionalSet::with_clean_capacity(Some(2));
        for n in 1..=4 {
            set.add_clean(id(n));
        }
        set.add_dirty(id(9));
        assert_eq!(set.overflow(), vec![id(1), id(2)]);
    }

    #[test]
    fn test_cleared_set_is_reused() {
        let mut set = TransactionalSet::with_clean_capacity(Some(1));
        set.add_clean(id(1));
        set.add_dirty(id(2));
        set.clear();
        assert!(set.is_empty());
        assert!(!set.contains(id(1)));

        set.add_clean(id(3));
        set.add_clean(id(4));
        assert_eq!(set.overflow(), vec![id(3)]);

        set.set_clean_capacity(None);
        assert!(set.overflow().is_empty());
    }

    proptest! {
        #[test]
        fn prop_single_partition(ops in prop::collection::vec((0u8..4, 0u64..6), 0..60)) {
            let mut set = TransactionalSet::new();
            for (op, n) in ops {
                match op {
                    0 => { set.add_clean(id(n)); }
                    1 => { set.add_dirty(id(n)); }
                    2 => { set.remove(id(n)); }
                    _ => set.flushed(),
                }
                let all = set.copy();
                let mut dedup = all.clone();
                dedup.sort();
                dedup.dedup();
                prop_assert_eq!(all.len(), dedup.len());
                prop_assert_eq!(all.len(), set.size());
            }
        }
    }
}
