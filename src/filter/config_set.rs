// src/filter/config_set.rs
//! Growable bitset over agent slots

use std::fmt;
use std::ops::{BitAndAssign, BitOrAssign};

const WORD_BITS: usize = 64;

/// Set of agent slot indices
#[derive(Clone, Default)]
pub struct ConfigSet {
    words: Vec<u64>,
}

impl ConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: usize) {
        let word = index / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index % WORD_BITS);
    }

    pub fn reset(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / WORD_BITS) {
            *word &= !(1u64 << (index % WORD_BITS));
        }
    }

    pub fn test(&self, index: usize) -> bool {
        self.words
            .get(index / WORD_BITS)
            .map(|w| w & (1u64 << (index % WORD_BITS)) != 0)
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Remove every index present in `other`
    pub fn subtract(&mut self, other: &ConfigSet) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
    }

    /// Lowest set index at or after `from`
    pub fn next(&self, from: usize) -> Option<usize> {
        let mut word = from / WORD_BITS;
        if word >= self.words.len() {
            return None;
        }

        let mut bits = self.words[word] & (!0u64 << (from % WORD_BITS));
        loop {
            if bits != 0 {
                return Some(word * WORD_BITS + bits.trailing_zeros() as usize);
            }
            word += 1;
            bits = *self.words.get(word)?;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = 0;
        std::iter::from_fn(move || {
            let found = self.next(cursor)?;
            cursor = found + 1;
            Some(found)
        })
    }
}

impl BitAndAssign<&ConfigSet> for ConfigSet {
    fn bitand_assign(&mut self, rhs: &ConfigSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= rhs.words.get(i).copied().unwrap_or(0);
        }
    }
}

impl BitOrAssign<&ConfigSet> for ConfigSet {
    fn bitor_assign(&mut self, rhs: &ConfigSet) {
        if rhs.words.len() > self.words.len() {
            self.words.resize(rhs.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(&rhs.words) {
            *w |= o;
        }
    }
}

impl FromIterator<usize> for ConfigSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = ConfigSet::new();
        for i in iter {
            set.set(i);
        }
        set
    }
}

impl fmt::Debug for ConfigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reset_test() {
        let mut set = ConfigSet::new();
        assert!(set.is_empty());

        set.set(3);
        set.set(130);
        assert!(set.test(3));
        assert!(set.test(130));
        assert!(!set.test(4));
        assert!(!set.test(10_000));
        assert_eq!(set.count(), 2);

        set.reset(3);
        assert!(!set.test(3));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_iteration_crosses_words() {
        let set: ConfigSet = [0, 63, 64, 200].into_iter().collect();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 63, 64, 200]);
        assert_eq!(set.next(65), Some(200));
        assert_eq!(set.next(201), None);
    }

    #[test]
    fn test_and_or_subtract() {
        let mut a: ConfigSet = [1, 2, 70].into_iter().collect();
        let b: ConfigSet = [2, 3].into_iter().collect();

        let mut union = a.clone();
        union |= &b;
        assert_eq!(union.iter().collect::<Vec<_>>(), vec![1, 2, 3, 70]);

        a &= &b;
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![2]);

        union.subtract(&b);
        assert_eq!(union.iter().collect::<Vec<_>>(), vec![1, 70]);
    }
}
