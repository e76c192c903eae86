//! In-memory TTL cache for settled gateway calls
//!
//! Entries expire lazily (checked on read) and through explicit sweeps.
//! When the cache grows past `max_size`, the oldest entries are evicted
//! until `max_size - eviction_slack` remain, so a full cache does not evict
//! on every insert.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Default number of entries kept before eviction
pub const DEFAULT_MAX_SIZE: usize = 100;

/// Extra entries evicted on overflow
pub const DEFAULT_EVICTION_SLACK: usize = 10;

/// Default entry lifetime
pub const DEFAULT_TTL_SECS: i64 = 300;

/// A settled, cacheable payload
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub signature: String,
    pub payload: T,
    pub created_at: DateTime<Utc>,
    /// Insertion order; breaks ties between entries created at the same instant
    seq: u64,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at < ttl
    }
}

/// Cache sizing and lifetime
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub max_size: usize,
    pub eviction_slack: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_TTL_SECS),
            max_size: DEFAULT_MAX_SIZE,
            eviction_slack: DEFAULT_EVICTION_SLACK,
        }
    }
}

pub struct ResponseCache<T> {
    entries: HashMap<String, CacheEntry<T>>,
    policy: CachePolicy,
    next_seq: u64,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
            next_seq: 0,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.entries.contains_key(signature)
    }

    /// Fresh payload for `signature`; an expired entry is removed and reported as a miss
    pub fn get(&mut self, signature: &str, now: DateTime<Utc>) -> Option<T> {
        let fresh = self.entries.get(signature)?.is_fresh(now, self.policy.ttl);
        if fresh {
            return self.entries.get(signature).map(|e| e.payload.clone());
        }

        self.entries.remove(signature);
        debug!("Cache entry expired: {}", signature);
        None
    }

    /// Insert or replace an entry, then enforce capacity. Returns the number evicted.
    pub fn insert(&mut self, signature: &str, payload: T, now: DateTime<Utc>) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            signature.to_string(),
            CacheEntry {
                signature: signature.to_string(),
                payload,
                created_at: now,
                seq,
            },
        );
        self.enforce_capacity()
    }

    fn enforce_capacity(&mut self) -> usize {
        let count = self.entries.len();
        if count <= self.policy.max_size {
            return 0;
        }

        let to_evict = (count - self.policy.max_size + self.policy.eviction_slack).min(count);
        let mut oldest: Vec<(DateTime<Utc>, u64, String)> = self
            .entries
            .values()
            .map(|e| (e.created_at, e.seq, e.signature.clone()))
            .collect();
        oldest.sort();

        for (_, _, signature) in oldest.into_iter().take(to_evict) {
            self.entries.remove(&signature);
        }

        debug!(
            "Cache over capacity ({} > {}), evicted {} oldest entries",
            count, self.policy.max_size, to_evict
        );
        to_evict
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.policy.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_fresh(now, ttl));
        before - self.entries.len()
    }

    /// Remove entries whose signature contains `pattern`, or everything when `None`
    pub fn clear(&mut self, pattern: Option<&str>) -> usize {
        let before = self.entries.len();
        match pattern {
            Some(pattern) => self.entries.retain(|sig, _| !sig.contains(pattern)),
            None => self.entries.clear(),
        }
        before - self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry<T>> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache<u32> {
        ResponseCache::new(CachePolicy::default())
    }

    #[test]
    fn test_get_fresh_entry() {
        let now = Utc::now();
        let mut cache = cache();
        cache.insert("GET:/a", 1, now);
        assert_eq!(cache.get("GET:/a", now + Duration::seconds(10)), Some(1));
        assert_eq!(cache.get("GET:/missing", now), None);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let now = Utc::now();
        let mut cache = cache();
        cache.insert("GET:/a", 1, now);

        let ttl = cache.policy().ttl;
        assert_eq!(cache.get("GET:/a", now + ttl - Duration::milliseconds(1)), Some(1));
        assert_eq!(cache.get("GET:/a", now + ttl + Duration::milliseconds(1)), None);
        // lazily removed on the expired read
        assert!(!cache.contains("GET:/a"));
    }

    #[test]
    fn test_entry_at_exact_ttl_is_stale() {
        let now = Utc::now();
        let mut cache = cache();
        cache.insert("k", 1, now);
        let ttl = cache.policy().ttl;
        assert_eq!(cache.get("k", now + ttl), None);
    }

    #[test]
    fn test_hysteresis_eviction() {
        let start = Utc::now();
        let mut cache = cache();
        let mut evicted = 0;
        for i in 0..101 {
            evicted += cache.insert(&format!("sig-{}", i), i, start + Duration::milliseconds(i as i64));
        }

        assert_eq!(evicted, 11);
        assert_eq!(cache.len(), 90);
        for i in 0..11 {
            assert!(!cache.contains(&format!("sig-{}", i)));
        }
        for i in 11..101 {
            assert!(cache.contains(&format!("sig-{}", i)));
        }
    }

    #[test]
    fn test_eviction_tie_break_uses_insertion_order() {
        let now = Utc::now();
        let mut cache = cache();
        for i in 0..101 {
            cache.insert(&format!("sig-{}", i), i, now);
        }
        assert_eq!(cache.len(), 90);
        assert!(!cache.contains("sig-10"));
        assert!(cache.contains("sig-11"));
    }

    #[test]
    fn test_no_eviction_until_over_capacity() {
        let now = Utc::now();
        let mut cache = cache();
        for i in 0..100 {
            assert_eq!(cache.insert(&format!("sig-{}", i), i, now), 0);
        }
        assert_eq!(cache.len(), 100);
    }

    #[test]
    fn test_reinsert_refreshes_age() {
        let now = Utc::now();
        let mut cache = cache();
        cache.insert("k", 1, now);
        let later = now + Duration::seconds(200);
        cache.insert("k", 2, later);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k", later + Duration::seconds(200)), Some(2));
    }

    #[test]
    fn test_sweep_expired() {
        let now = Utc::now();
        let mut cache = cache();
        cache.insert("old", 1, now - Duration::seconds(600));
        cache.insert("new", 2, now);
        assert_eq!(cache.sweep_expired(now), 1);
        assert!(cache.contains("new"));
        assert!(!cache.contains("old"));
    }

    #[test]
    fn test_clear_by_pattern() {
        let now = Utc::now();
        let mut cache = cache();
        cache.insert("GET:https://api.test/users?page=1", 1, now);
        cache.insert("GET:https://api.test/users?page=2", 2, now);
        cache.insert("GET:https://api.test/orders", 3, now);

        assert_eq!(cache.clear(Some("/users")), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_small_capacity_eviction_never_underflows() {
        let now = Utc::now();
        let mut cache = ResponseCache::new(CachePolicy {
            ttl: Duration::seconds(60),
            max_size: 2,
            eviction_slack: 10,
        });
        cache.insert("a", 1, now);
        cache.insert("b", 2, now);
        assert_eq!(cache.insert("c", 3, now), 3);
        assert!(cache.is_empty());
    }
}
