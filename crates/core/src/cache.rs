//! Capacity- and age-bounded cache.
//!
//! One dedicated type instead of bare maps with ad-hoc eviction on insert:
//! explicit capacity (LRU), explicit TTL, and an optional eviction hook so
//! owners can observe what falls out.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

type EvictionHook<K, V> = Box<dyn Fn(&K, &V) + Send>;

/// LRU cache whose entries also expire `ttl` after insertion.
///
/// Not internally synchronized; owners wrap it in the lock that matches their
/// access pattern.
pub struct TtlCache<K: Eq + Hash, V> {
    entries: LruCache<K, Entry<V>>,
    ttl: Duration,
    on_evict: Option<EvictionHook<K, V>>,
}

impl<K: Eq + Hash, V> TtlCache<K, V> {
    /// `capacity` must be non-zero; a zero capacity is a configuration error
    /// callers reject before construction.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: LruCache::new(capacity),
            ttl,
            on_evict: None,
        }
    }

    pub fn with_eviction_hook(mut self, hook: impl Fn(&K, &V) + Send + 'static) -> Self {
        self.on_evict = Some(Box::new(hook));
        self
    }

    /// Insert, evicting the LRU entry if at capacity.
    pub fn put(&mut self, key: K, value: V) {
        let entry = Entry {
            value,
            inserted_at: Instant::now(),
        };
        if let Some((old_key, old)) = self.entries.push(key, entry) {
            // push returns the displaced LRU pair when capacity was hit, or
            // the previous value under the same key; only the former is an
            // eviction worth reporting.
            if let Some(hook) = &self.on_evict {
                hook(&old_key, &old.value);
            }
        }
    }

    /// Fetch a live entry, refreshing its LRU position. Expired entries are
    /// removed on access and reported as misses.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            if let Some((k, entry)) = self.entries.pop_entry(key) {
                if let Some(hook) = &self.on_evict {
                    hook(&k, &entry.value);
                }
            }
            return None;
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    /// Drop every expired entry. Called opportunistically by owners; `get`
    /// already handles per-key expiry.
    pub fn purge_expired(&mut self) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            if let Some((k, entry)) = self.entries.pop_entry(&key) {
                if let Some(hook) = &self.on_evict {
                    hook(&k, &entry.value);
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn put_get_roundtrip() {
        let mut cache: TtlCache<String, u32> = TtlCache::new(4, Duration::from_secs(60));
        cache.put("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(&1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn capacity_evicts_lru() {
        let mut cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.put(1, 10);
        cache.put(2, 20);
        // Touch 1 so 2 becomes LRU.
        assert!(cache.get(&1).is_some());
        cache.put(3, 30);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(&10));
        assert_eq!(cache.get(&3), Some(&30));
    }

    #[test]
    fn ttl_expires_entries() {
        let mut cache: TtlCache<u32, u32> = TtlCache::new(4, Duration::from_millis(0));
        cache.put(1, 10);
        // Zero TTL: expired on the very next access.
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_hook_fires_on_capacity() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let hook_count = evicted.clone();
        let mut cache: TtlCache<u32, u32> = TtlCache::new(1, Duration::from_secs(60))
            .with_eviction_hook(move |_, _| {
                hook_count.fetch_add(1, Ordering::Relaxed);
            });
        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(evicted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn purge_expired_counts() {
        let mut cache: TtlCache<u32, u32> = TtlCache::new(8, Duration::from_millis(0));
        cache.put(1, 1);
        cache.put(2, 2);
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }
}
