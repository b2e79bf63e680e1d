use chrono::{DateTime, Duration, Utc};

use crate::cache::BoundedCache;

/// In-memory record of recently created group keys.
pub struct DedupCache {
    seen: BoundedCache<String, ()>,
    window: Duration,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, window: Duration, ttl: Duration) -> Self {
        Self {
            seen: BoundedCache::new(capacity),
            window,
            ttl,
        }
    }

    /// True when `key` was recorded less than `window` ago.
    pub fn is_recent(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.seen
            .inserted_at(&key.to_string())
            .is_some_and(|at| now - at < self.window)
    }

    pub fn record(&mut self, key: String, now: DateTime<Utc>) {
        self.seen.insert(key, (), now);
    }

    /// Drop entries older than the ttl. Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        self.seen.prune_older_than(now - self.ttl)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window() {
        let mut cache = DedupCache::new(16, Duration::seconds(60), Duration::minutes(5));
        let t0 = Utc::now();
        cache.record("k".into(), t0);

        assert!(cache.is_recent("k", t0 + Duration::seconds(59)));
        assert!(!cache.is_recent("k", t0 + Duration::seconds(60)));
        assert!(!cache.is_recent("other", t0));
    }

    #[test]
    fn test_prune_and_capacity() {
        let mut cache = DedupCache::new(2, Duration::seconds(60), Duration::minutes(5));
        let t0 = Utc::now();
        cache.record("a".into(), t0);
        cache.record("b".into(), t0 + Duration::minutes(4));
        cache.record("c".into(), t0 + Duration::minutes(4));
        // Capacity 2 evicts the oldest
        assert_eq!(cache.len(), 2);
        assert!(!cache.is_recent("a", t0));

        assert_eq!(cache.prune(t0 + Duration::minutes(10)), 2);
        assert!(cache.is_empty());
    }
}
