//! Cache holds previously resolved component descriptors.

use std::{
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

use lru::LruCache;
use tracing::trace;

use crate::resolve::{ResolveResult, key::ResolutionKey};

/// DescriptorCache is a size-bounded, optionally expiring store of resolution
/// results, keyed by resolution key.
///
/// All access is serialized under a single mutex; there is no background
/// sweeper, expiry is checked on read. A zero TTL disables expiration, which
/// keeps tests deterministic.
pub struct DescriptorCache {
    ttl: Duration,
    inner: Mutex<LruCache<ResolutionKey, Entry>>,
}

struct Entry {
    result: ResolveResult,
    inserted: Instant,
}

impl DescriptorCache {
    /// New builds a cache holding at most `capacity` entries, each expiring
    /// after `ttl` (zero disables expiry).
    pub fn new(capacity: usize, ttl: Duration) -> DescriptorCache {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        DescriptorCache {
            ttl,
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get returns the cached result for `key`, if present and fresh.
    pub fn get(&self, key: &ResolutionKey) -> Option<ResolveResult> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let expired = match inner.get(key) {
            None => return None,
            Some(e) => !self.ttl.is_zero() && e.inserted.elapsed() >= self.ttl,
        };
        if expired {
            trace!(%key, "evicting expired entry");
            inner.pop(key);
            return None;
        }
        inner.get(key).map(|e| e.result.clone())
    }

    /// Insert stores `result` under `key`, evicting the least recently used
    /// entry on overflow.
    pub fn insert(&self, key: ResolutionKey, result: ResolveResult) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.put(
            key,
            Entry {
                result,
                inserted: Instant::now(),
            },
        );
    }

    /// Len reports the number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").len()
    }

    /// Is_empty reports whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
