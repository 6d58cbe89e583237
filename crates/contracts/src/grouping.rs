//! Ordered grouping helpers
//!
//! `GroupedBatch` is an ordered multimap: groups iterate in order of first
//! key occurrence, members keep input order within their group.

use std::collections::HashMap;
use std::hash::Hash;

/// Items partitioned by a derived key
#[derive(Debug, Clone)]
pub struct GroupedBatch<K, T> {
    index: HashMap<K, usize>,
    groups: Vec<(K, Vec<T>)>,
}

impl<K, T> Default for GroupedBatch<K, T> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            groups: Vec::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, T> GroupedBatch<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition `items` by `key_fn`, built once per batch
    pub fn build(items: impl IntoIterator<Item = T>, mut key_fn: impl FnMut(&T) -> K) -> Self {
        let mut grouped = Self::new();
        for item in items {
            let key = key_fn(&item);
            grouped.push(key, item);
        }
        grouped
    }

    pub fn push(&mut self, key: K, item: T) {
        match self.index.get(&key) {
            Some(&slot) => self.groups[slot].1.push(item),
            None => {
                self.index.insert(key.clone(), self.groups.len());
                self.groups.push((key, vec![item]));
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&[T]> {
        self.index
            .get(key)
            .map(|&slot| self.groups[slot].1.as_slice())
    }

    /// Number of groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.groups.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &[T])> {
        self.groups.iter().map(|(k, v)| (k, v.as_slice()))
    }
}

impl<K, T> IntoIterator for GroupedBatch<K, T> {
    type Item = (K, Vec<T>);
    type IntoIter = std::vec::IntoIter<(K, Vec<T>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.into_iter()
    }
}

/// Split `items` into consecutive chunks of at most `max` (a zero `max` is
/// treated as one)
pub fn chunk<T>(items: Vec<T>, max: usize) -> Vec<Vec<T>> {
    let max = max.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(max));
    let mut current = Vec::with_capacity(max.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == max {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(max)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
