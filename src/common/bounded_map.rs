// # Bounded Map with LRU Eviction
//
// A capacity-bounded map that drops the least-recently-touched entry when
// full. Used for the prefetcher's per-key pattern table, which must stay
// bounded no matter how many distinct objects pass through the mount.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// A map with a maximum entry count; inserting past capacity evicts the
/// least recently inserted-or-read key.
pub struct BoundedLruMap<K: Eq + Hash + Clone, V> {
    map: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedLruMap<K, V> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedLruMap capacity must be > 0");
        Self {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Inserts a key-value pair, marking the key most recently used.
    ///
    /// Returns the evicted entry if the insert pushed the map past
    /// capacity, or `None` otherwise.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.touch(&key);
        let existed = self.map.insert(key, value).is_some();
        if !existed && self.map.len() > self.capacity {
            if let Some(lru) = self.order.pop_front() {
                return self.map.remove(&lru).map(|v| (lru, v));
            }
        }
        None
    }

    /// Mutable access that refreshes the key's recency.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.map.contains_key(key) {
            self.touch(key);
            self.map.get_mut(key)
        } else {
            None
        }
    }

    /// Read access without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.order.retain(|k| k != key);
        self.map.remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    fn touch(&mut self, key: &K) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_peek() {
        let mut map = BoundedLruMap::new(4);
        assert!(map.insert("a", 1).is_none());
        assert_eq!(map.peek(&"a"), Some(&1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_eviction_order() {
        let mut map = BoundedLruMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        let evicted = map.insert("c", 3);
        assert_eq!(evicted, Some(("a", 1)));
        assert!(map.peek(&"a").is_none());
        assert!(map.peek(&"b").is_some());
    }

    #[test]
    fn test_get_mut_refreshes_recency() {
        let mut map = BoundedLruMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        map.get_mut(&"a");
        let evicted = map.insert("c", 3);
        assert_eq!(evicted, Some(("b", 2)));
        assert!(map.peek(&"a").is_some());
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let mut map = BoundedLruMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert!(map.insert("a", 10).is_none());
        assert_eq!(map.peek(&"a"), Some(&10));
        assert_eq!(map.len(), 2);
    }

    #[test]
    #[should_panic(expected = "BoundedLruMap capacity must be > 0")]
    fn test_zero_capacity() {
        let _ = BoundedLruMap::<String, i32>::new(0);
    }
}
