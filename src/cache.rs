//! Bounded TTL memoization cache
//!
//! Process-wide store for expensive, stable-for-a-while lookups
//! (decoded interface definitions, fetched account contents).
//! Entries expire after their TTL; once the cache is full the
//! least-recently-used live entry is evicted. Lookups never block on
//! anything but the map lock; a miss simply sends the caller down
//! the normal fetch path.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
    /// Monotonic recency stamp; smallest is least recently used.
    touched: u64,
}

/// Thread-safe TTL + LRU cache.
pub struct TtlCache<K, V> {
    entries: Mutex<(HashMap<K, Entry<V>>, u64)>,
    max_entries: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(max_entries: usize) -> Self {
        assert!(max_entries > 0, "cache capacity must be non-zero");
        Self {
            entries: Mutex::new((HashMap::new(), 0)),
            max_entries,
        }
    }

    /// Fetch a live entry, bumping its recency. Expired entries are
    /// removed on the way out.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.entries.lock().unwrap();
        let (map, clock) = &mut *guard;

        let expired = match map.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                *clock += 1;
                entry.touched = *clock;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            map.remove(key);
        }
        None
    }

    /// Insert or replace. When full, expired entries are dropped
    /// first; if still full, the least-recently-used entry goes.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let mut guard = self.entries.lock().unwrap();
        let (map, clock) = &mut *guard;
        let now = Instant::now();

        if !map.contains_key(&key) && map.len() >= self.max_entries {
            map.retain(|_, e| e.expires_at > now);
            if map.len() >= self.max_entries {
                if let Some(lru) = map
                    .iter()
                    .min_by_key(|(_, e)| e.touched)
                    .map(|(k, _)| k.clone())
                {
                    map.remove(&lru);
                }
            }
        }

        *clock += 1;
        map.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                touched: *clock,
            },
        );
    }

    /// Live entry count (expired entries may still be counted until
    /// touched or displaced).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache: TtlCache<String, u32> = TtlCache::new(4);
        assert_eq!(cache.get(&"a".to_string()), None);

        cache.insert("a".to_string(), 1, Duration::from_secs(60));
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn expired_entries_are_gone() {
        let cache: TtlCache<String, u32> = TtlCache::new(4);
        cache.insert("a".to_string(), 1, Duration::from_millis(0));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_eviction_when_full() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(2);
        cache.insert("a", 1, Duration::from_secs(60));
        cache.insert("b", 2, Duration::from_secs(60));

        // Touch "a" so "b" becomes least recently used.
        assert_eq!(cache.get(&"a"), Some(1));

        cache.insert("c", 3, Duration::from_secs(60));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn expired_entries_evicted_before_live_ones() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(2);
        cache.insert("short", 1, Duration::from_millis(0));
        cache.insert("long", 2, Duration::from_secs(60));

        cache.insert("new", 3, Duration::from_secs(60));
        assert_eq!(cache.get(&"long"), Some(2));
        assert_eq!(cache.get(&"new"), Some(3));
    }

    #[test]
    fn replace_does_not_evict() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(2);
        cache.insert("a", 1, Duration::from_secs(60));
        cache.insert("b", 2, Duration::from_secs(60));
        cache.insert("a", 10, Duration::from_secs(60));

        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), Some(2));
    }
}
