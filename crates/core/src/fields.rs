//! Field bit-vectors
//!
//! One bit per declared field index. Used for loaded/dirty/flushed tracking,
//! fetch-group membership and load requests. Types with up to 128 fields stay
//! inline.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

const WORD_BITS: usize = 64;

/// Set of field indexes
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FieldSet {
    words: SmallVec<[u64; 2]>,
}

impl FieldSet {
    fn significant(&self) -> &[u64] {
        let end = self
            .words
            .iter()
            .rposition(|w| *w != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.words[..end]
    }
}

// Trailing zero words are not significant.
impl PartialEq for FieldSet {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for FieldSet {}

impl std::hash::Hash for FieldSet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl FieldSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set containing every index below `len`
    pub fn full(len: usize) -> Self {
        let mut set = FieldSet::new();
        for i in 0..len {
            set.insert(i);
        }
        set
    }

    /// Add an index, returning whether it was newly added
    pub fn insert(&mut self, index: usize) -> bool {
        let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    /// Remove an index, returning whether it was present
    pub fn remove(&mut self, index: usize) -> bool {
        let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
        match self.words.get_mut(word) {
            Some(w) => {
                let mask = 1u64 << bit;
                let present = *w & mask != 0;
                *w &= !mask;
                present
            }
            None => false,
        }
    }

    /// Whether the index is present
    pub fn contains(&self, index: usize) -> bool {
        let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
        self.words
            .get(word)
            .map(|w| w & (1u64 << bit) != 0)
            .unwrap_or(false)
    }

    /// Whether no index is present
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of indexes present
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Remove every index
    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Add every index of `other`
    pub fn union_with(&mut self, other: &FieldSet) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= *o;
        }
    }

    /// Remove every index of `other`
    pub fn difference_with(&mut self, other: &FieldSet) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= !*o;
        }
    }

    /// Keep only indexes also in `other`
    pub fn intersect_with(&mut self, other: &FieldSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    /// Indexes in `self` but not in `other`
    pub fn difference(&self, other: &FieldSet) -> FieldSet {
        let mut out = self.clone();
        out.difference_with(other);
        out
    }

    /// Indexes in both sets
    pub fn intersection(&self, other: &FieldSet) -> FieldSet {
        let mut out = self.clone();
        out.intersect_with(other);
        out
    }

    /// Whether every index of `self` is in `other`
    pub fn is_subset(&self, other: &FieldSet) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(i, w)| w & !other.words.get(i).copied().unwrap_or(0) == 0)
    }

    /// Whether the sets share an index
    pub fn intersects(&self, other: &FieldSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Indexes in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, w)| {
            let w = *w;
            (0..WORD_BITS)
                .filter(move |b| w & (1u64 << b) != 0)
                .map(move |b| wi * WORD_BITS + b)
        })
    }
}

impl FromIterator<usize> for FieldSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = FieldSet::new();
        for i in iter {
            set.insert(i);
        }
        set
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_remove_contains() {
        let mut set = FieldSet::new();
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.insert(130));
        assert!(set.contains(3));
        assert!(set.contains(130));
        assert!(!set.contains(4));
        assert_eq!(set.len(), 2);
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert!(!set.remove(999));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![130]);
    }

    #[test]
    fn test_empty_after_clear_and_trailing_zero_words() {
        let mut set: FieldSet = [1, 70].into_iter().collect();
        set.remove(70);
        set.remove(1);
        assert!(set.is_empty());
        set.insert(2);
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_set_algebra() {
        let a: FieldSet = [0, 1, 2, 65].into_iter().collect();
        let b: FieldSet = [1, 65, 100].into_iter().collect();
        assert_eq!(a.intersection(&b).iter().collect::<Vec<_>>(), vec![1, 65]);
        assert_eq!(a.difference(&b).iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(a.intersects(&b));
        let mut u = a.clone();
        u.union_with(&b);
        assert_eq!(u.len(), 5);
        assert!(a.is_subset(&u));
        assert!(!u.is_subset(&a));
    }

    #[test]
    fn test_equality_ignores_capacity() {
        let mut a: FieldSet = [1, 90].into_iter().collect();
        a.remove(90);
        let b: FieldSet = [1].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_full() {
        let set = FieldSet::full(5);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    proptest! {
        #[test]
        fn prop_difference_is_subset_and_disjoint(
            a in proptest::collection::vec(0usize..200, 0..40),
            b in proptest::collection::vec(0usize..200, 0..40),
        ) {
            let a: FieldSet = a.into_iter().collect();
            let b: FieldSet = b.into_iter().collect();
            let d = a.difference(&b);
            prop_assert!(d.is_subset(&a));
            prop_assert!(!d.intersects(&b));
            prop_assert_eq!(d.len() + a.intersection(&b).len(), a.len());
        }
    }
}
