use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Bounded, insertion-ordered cache. On overflow the oldest entry is
/// evicted before the new one is inserted; lookups never reorder entries
/// (spec §4.7 — this is FIFO eviction, not LRU-on-access).
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    order: VecDeque<K>,
    map: HashMap<K, V>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be nonzero");
        BoundedCache {
            capacity,
            order: VecDeque::with_capacity(capacity),
            map: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or overwrite `key`. Overwriting an existing key does not move
    /// it in eviction order (matches the Python `OrderedDict` subclass this
    /// is grounded on, which never reorders on write either).
    pub fn insert(&mut self, key: K, value: V) {
        if self.map.contains_key(&key) {
            self.map.insert(key, value);
            return;
        }
        while self.map.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            } else {
                break;
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_on_overflow() {
        let mut cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
        assert!(cache.contains(&"c"));
    }

    #[test]
    fn lookup_does_not_reorder() {
        let mut cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Access "a" repeatedly; a real LRU would promote it and spare it.
        for _ in 0..5 {
            assert_eq!(cache.get(&"a"), Some(&1));
        }
        cache.insert("c", 3);
        assert!(!cache.contains(&"a"), "insertion-order cache must not reorder on get");
        assert!(cache.contains(&"b"));
        assert!(cache.contains(&"c"));
    }

    #[test]
    fn retains_n_most_recent_after_k_gt_n_inserts() {
        let capacity = 1024;
        let mut cache = BoundedCache::new(capacity);
        let total = capacity + 100;
        for i in 0..total {
            cache.insert(i, i);
        }
        assert_eq!(cache.len(), capacity);
        for i in 100..total {
            assert!(cache.contains(&i));
        }
        for i in 0..100 {
            assert!(!cache.contains(&i));
        }
    }
}
