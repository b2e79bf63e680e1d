use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Fixed-capacity map that evicts the oldest insertion first.
///
/// Every entry carries its insertion time so owners can also expire by age.
/// Re-inserting a key refreshes both its value and its position.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, DateTime<Utc>)>,
    order: VecDeque<K>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn insert(&mut self, key: K, value: V, now: DateTime<Utc>) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.entries.insert(key.clone(), (value, now));
        self.order.push_back(key);

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(v, _)| v)
    }

    pub fn inserted_at(&self, key: &K) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|(_, at)| *at)
    }

    /// Drop every entry inserted before `cutoff`. Returns how many were removed.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, at)| *at >= cutoff);
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_evicts_oldest_first() {
        let now = Utc::now();
        let mut cache = BoundedCache::new(2);
        cache.insert("a", 1, now);
        cache.insert("b", 2, now);
        cache.insert("c", 3, now);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"a").is_none());
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.get(&"c"), Some(&3));
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let now = Utc::now();
        let mut cache = BoundedCache::new(2);
        cache.insert("a", 1, now);
        cache.insert("b", 2, now);
        cache.insert("a", 10, now);
        cache.insert("c", 3, now);

        // "b" is now the oldest entry
        assert!(cache.get(&"b").is_none());
        assert_eq!(cache.get(&"a"), Some(&10));
    }

    #[test]
    fn test_prune_by_age() {
        let now = Utc::now();
        let mut cache = BoundedCache::new(10);
        cache.insert("old", 1, now - Duration::minutes(10));
        cache.insert("fresh", 2, now);

        let removed = cache.prune_older_than(now - Duration::minutes(5));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.inserted_at(&"fresh").is_some());

        // order queue stays consistent after pruning
        cache.insert("x", 3, now);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = BoundedCache::new(0);
        cache.insert(1u32, "x", Utc::now());
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
    }
}
