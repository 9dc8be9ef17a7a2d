//! Bounded LRU caches used for write deduplication and query results.
//!
//! Both wrappers own their synchronization so callers can share them
//! freely across threads. A capacity of zero disables the cache.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// Membership-only LRU: `contains` touches, `add` evicts the least
/// recently used entry when full.
pub struct LruSet<K: Hash + Eq> {
    inner: Option<Mutex<LruCache<K, ()>>>,
}

impl<K: Hash + Eq> LruSet<K> {
    pub fn new(capacity: usize) -> Self {
        let inner = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self { inner }
    }

    pub fn contains(&self, key: &K) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };

        inner.lock().unwrap().get(key).is_some()
    }

    pub fn add(&self, key: K) {
        if let Some(inner) = &self.inner {
            inner.lock().unwrap().put(key, ());
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.lock().unwrap().len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key-value LRU with the same eviction policy; values are cloned out.
pub struct LruMap<K: Hash + Eq, V: Clone> {
    inner: Option<Mutex<LruCache<K, V>>>,
}

impl<K: Hash + Eq, V: Clone> LruMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        let inner = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self { inner }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.as_ref()?.lock().unwrap().get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        if let Some(inner) = &self.inner {
            inner.lock().unwrap().put(key, value);
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.lock().unwrap().len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bounds_membership_to_capacity() {
        let set = LruSet::new(4);

        for n in 0..20 {
            set.add(n);
        }

        assert_eq!(set.len(), 4);
        for n in 16..20 {
            assert!(set.contains(&n));
        }
        assert!(!set.contains(&0));
    }

    #[test]
    fn touched_entries_survive_eviction() {
        let set = LruSet::new(2);
        set.add("a");
        set.add("b");

        // touching "a" makes "b" the eviction candidate
        assert!(set.contains(&"a"));
        set.add("c");

        assert!(set.contains(&"a"));
        assert!(!set.contains(&"b"));
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let set = LruSet::new(0);
        set.add(1);
        assert!(!set.contains(&1));
        assert!(set.is_empty());

        let map: LruMap<u32, u32> = LruMap::new(0);
        map.put(1, 1);
        assert_eq!(map.get(&1), None);
    }

    #[test]
    fn map_returns_cloned_values() {
        let map = LruMap::new(2);
        map.put("k", vec![1, 2, 3]);

        assert_eq!(map.get(&"k"), Some(vec![1, 2, 3]));
        assert_eq!(map.get(&"missing"), None);
    }
}
