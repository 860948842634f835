//! Bounded, TTL-based caches.
//!
//! One design, three instances: DN→partition routing, DN→resolved entry,
//! and primary-key→backend row. Entries expire after a per-cache TTL
//! (minute granularity in config) and are swept lazily on access; there is
//! no background timer. When a `put` of a new key finds the cache full, the
//! oldest-inserted entry is evicted. Invalidation is explicit and used by
//! the write path.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Capacity and TTL settings for one cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Entry lifetime in minutes.
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,
}

fn default_capacity() -> usize {
    100
}
fn default_ttl_minutes() -> u64 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_minutes: default_ttl_minutes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct Inner<K, V> {
    data: HashMap<K, (V, Instant)>,
    /// Keys in first-insertion order; re-puts keep the original position.
    order: VecDeque<K>,
}

/// A bounded cache with per-entry TTL and oldest-inserted eviction.
pub struct Cache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_ttl(config.capacity, Duration::from_secs(config.ttl_minutes * 60))
    }

    /// Construct with an explicit TTL; used by tests needing sub-minute
    /// expiry.
    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
            ttl,
        }
    }

    /// Return the value if present and unexpired. An expired entry is
    /// removed on the way out.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.data.get(key) {
            Some((_, expiry)) => Instant::now() >= *expiry,
            None => return None,
        };
        if expired {
            inner.data.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        inner.data.get(key).map(|(value, _)| value.clone())
    }

    /// Insert or refresh a value. A new key evicts the oldest-inserted
    /// entry when the cache is full; a re-put keeps the key's original
    /// insertion position.
    pub fn put(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let expiry = Instant::now() + self.ttl;
        if inner.data.contains_key(&key) {
            inner.data.insert(key, (value, expiry));
            return;
        }
        while inner.data.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    trace!("cache full, evicting oldest entry");
                    inner.data.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(key.clone());
        inner.data.insert(key, (value, expiry));
    }

    /// Drop one entry.
    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.data.remove(key);
        inner.order.retain(|k| k != key);
    }

    /// Drop everything.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.order.clear();
    }

    /// Number of entries, expired ones included until they are swept.
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, ttl: Duration) -> Cache<String, String> {
        Cache::with_ttl(capacity, ttl)
    }

    #[test]
    fn test_put_get() {
        let c = cache(10, Duration::from_secs(60));
        c.put("k".into(), "v".into());
        assert_eq!(c.get(&"k".into()), Some("v".into()));
        assert_eq!(c.get(&"other".into()), None);
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let c = cache(10, Duration::from_millis(20));
        c.put("k".into(), "v".into());
        assert_eq!(c.get(&"k".into()), Some("v".into()));

        std::thread::sleep(Duration::from_millis(40));
        // No explicit removal happened; the expired entry is still counted
        // until the next access sweeps it.
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(&"k".into()), None);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_oldest_inserted_eviction() {
        let c = cache(2, Duration::from_secs(60));
        c.put("a".into(), "1".into());
        c.put("b".into(), "2".into());
        // Refreshing "a" keeps its original insertion position.
        c.put("a".into(), "1b".into());
        c.put("c".into(), "3".into());

        assert_eq!(c.get(&"a".into()), None);
        assert_eq!(c.get(&"b".into()), Some("2".into()));
        assert_eq!(c.get(&"c".into()), Some("3".into()));
    }

    #[test]
    fn test_invalidate() {
        let c = cache(10, Duration::from_secs(60));
        c.put("a".into(), "1".into());
        c.put("b".into(), "2".into());
        c.invalidate(&"a".into());
        assert_eq!(c.get(&"a".into()), None);
        assert_eq!(c.get(&"b".into()), Some("2".into()));

        c.invalidate_all();
        assert!(c.is_empty());
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let c = cache(0, Duration::from_secs(60));
        c.put("a".into(), "1".into());
        assert_eq!(c.get(&"a".into()), None);
    }
}
