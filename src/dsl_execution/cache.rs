//! Process-wide cache of compiled module artifacts.
//!
//! Entries are keyed by module name and content hash. Each entry counts the
//! leases handed out for it; an entry that is invalidated or replaced while
//! leased is retired and dropped when its last lease is released, so no
//! in-flight invocation ever loses its artifact.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Hex-encoded SHA-256 of a module's source.
pub type ContentHash = String;

/// Identity of a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Logical module name
    pub module: String,
    /// Hash of the source the artifact was built from
    pub content_hash: ContentHash,
}

impl CacheKey {
    pub fn new(module: impl Into<String>, content_hash: impl Into<ContentHash>) -> Self {
        Self {
            module: module.into(),
            content_hash: content_hash.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.content_hash.get(..12).unwrap_or(&self.content_hash);
        write!(f, "{}@{}", self.module, short)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently served to new loads
    pub live_entries: usize,
    /// Invalidated entries still referenced by in-flight invocations
    pub retired_entries: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that had to build an artifact
    pub misses: u64,
    /// Artifacts built, including ones discarded after losing an insert race
    pub compiles: u64,
    /// Entries dropped from the cache
    pub evictions: u64,
}

struct CacheSlot<A> {
    id: u64,
    content_hash: ContentHash,
    artifact: Arc<A>,
    active: usize,
}

struct CacheState<A> {
    live: HashMap<String, CacheSlot<A>>,
    retired: HashMap<u64, CacheSlot<A>>,
    next_id: u64,
    hits: u64,
    misses: u64,
    compiles: u64,
    evictions: u64,
}

impl<A> CacheState<A> {
    fn new() -> Self {
        Self {
            live: HashMap::new(),
            retired: HashMap::new(),
            next_id: 0,
            hits: 0,
            misses: 0,
            compiles: 0,
            evictions: 0,
        }
    }

    fn retire(&mut self, module: &str, slot: CacheSlot<A>) {
        if slot.active == 0 {
            self.evictions += 1;
            debug!("🗑️ Evicted cache entry for module '{}'", module);
        } else {
            debug!(
                "⏳ Deferred eviction for module '{}' ({} active references)",
                module, slot.active
            );
            self.retired.insert(slot.id, slot);
        }
    }
}

/// Inner cache state shared with outstanding leases.
struct CacheInner<A> {
    state: Mutex<CacheState<A>>,
}

impl<A> CacheInner<A> {
    fn lock(&self) -> MutexGuard<'_, CacheState<A>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, module: &str, id: u64) {
        let mut state = self.lock();
        if let Some(slot) = state.live.get_mut(module) {
            if slot.id == id {
                slot.active = slot.active.saturating_sub(1);
                return;
            }
        }

        let drained = match state.retired.get_mut(&id) {
            Some(slot) => {
                slot.active = slot.active.saturating_sub(1);
                slot.active == 0
            }
            None => false,
        };
        if drained {
            state.retired.remove(&id);
            state.evictions += 1;
            debug!("🗑️ Evicted retired cache entry for module '{}'", module);
        }
    }
}

/// Thread-safe artifact cache; clones share the same entries.
pub struct ExecutionCache<A> {
    inner: Arc<CacheInner<A>>,
}

impl<A> Clone for ExecutionCache<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> Default for ExecutionCache<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ExecutionCache<A> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::new()),
            }),
        }
    }

    /// Returns a lease on the artifact for `key`, building it with `producer`
    /// on a miss. A live entry for the same module with another hash is
    /// replaced, never merged.
    pub fn get_or_insert<E, F>(&self, key: &CacheKey, producer: F) -> Result<CacheLease<A>, E>
    where
        F: FnOnce() -> Result<A, E>,
    {
        if let Some(lease) = self.lease_live(key, true) {
            return Ok(lease);
        }

        // Built outside the lock; a concurrent loader may win the insert.
        let artifact = producer()?;

        let mut state = self.inner.lock();
        state.compiles += 1;
        if let Some(slot) = state.live.get_mut(&key.module) {
            if slot.content_hash == key.content_hash {
                slot.active += 1;
                let (id, artifact) = (slot.id, Arc::clone(&slot.artifact));
                drop(state);
                return Ok(self.make_lease(key, id, artifact));
            }
        }

        if let Some(stale) = state.live.remove(&key.module) {
            state.retire(&key.module, stale);
        }

        let id = state.next_id;
        state.next_id += 1;
        let artifact = Arc::new(artifact);
        state.live.insert(
            key.module.clone(),
            CacheSlot {
                id,
                content_hash: key.content_hash.clone(),
                artifact: Arc::clone(&artifact),
                active: 1,
            },
        );
        drop(state);

        debug!("📦 Cached artifact {}", key);
        Ok(self.make_lease(key, id, artifact))
    }

    /// Lease on the live entry for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<CacheLease<A>> {
        self.lease_live(key, false)
    }

    /// Whether a live entry exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner
            .lock()
            .live
            .get(&key.module)
            .map(|slot| slot.content_hash == key.content_hash)
            .unwrap_or(false)
    }

    /// Removes the live entry for `module`. Referenced entries are retired
    /// and dropped once their last lease is released.
    pub fn invalidate(&self, module: &str) -> bool {
        let mut state = self.inner.lock();
        match state.live.remove(module) {
            Some(slot) => {
                state.retire(module, slot);
                true
            }
            None => false,
        }
    }

    /// Invalidates every live entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock();
        let drained: Vec<(String, CacheSlot<A>)> = state.live.drain().collect();
        let count = drained.len();
        for (module, slot) in drained {
            state.retire(&module, slot);
        }
        count
    }

    /// Number of leases outstanding for the live entry of `module`.
    pub fn active_references(&self, module: &str) -> usize {
        self.inner
            .lock()
            .live
            .get(module)
            .map(|slot| slot.active)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock();
        CacheStats {
            live_entries: state.live.len(),
            retired_entries: state.retired.len(),
            hits: state.hits,
            misses: state.misses,
            compiles: state.compiles,
            evictions: state.evictions,
        }
    }

    fn lease_live(&self, key: &CacheKey, count_miss: bool) -> Option<CacheLease<A>> {
        let mut state = self.inner.lock();
        let found = match state.live.get_mut(&key.module) {
            Some(slot) if slot.content_hash == key.content_hash => {
                slot.active += 1;
                Some((slot.id, Arc::clone(&slot.artifact)))
            }
            _ => None,
        };

        match found {
            Some((id, artifact)) => {
                state.hits += 1;
                drop(state);
                Some(self.make_lease(key, id, artifact))
            }
            None => {
                if count_miss {
                    state.misses += 1;
                }
                None
            }
        }
    }

    fn make_lease(&self, key: &CacheKey, id: u64, artifact: Arc<A>) -> CacheLease<A> {
        CacheLease {
            key: key.clone(),
            id,
            artifact,
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Counted reference to a cached artifact, released on drop.
pub struct CacheLease<A> {
    key: CacheKey,
    id: u64,
    artifact: Arc<A>,
    inner: Arc<CacheInner<A>>,
}

impl<A> CacheLease<A> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn artifact(&self) -> &Arc<A> {
        &self.artifact
    }
}

impl<A> Deref for CacheLease<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.artifact
    }
}

impl<A> fmt::Debug for CacheLease<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLease")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl<A> Drop for CacheLease<A> {
    fn drop(&mut self) {
        self.inner.release(&self.key.module, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn key(module: &str, hash: &str) -> CacheKey {
        CacheKey::new(module, hash)
    }

    fn build(counter: &AtomicUsize, value: &str) -> Result<String, ()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(value.to_string())
    }

    #[test]
    fn test_same_key_returns_same_artifact() {
        let cache = ExecutionCache::new();
        let builds = AtomicUsize::new(0);

        let first = cache.get_or_insert(&key("m", "h1"), || build(&builds, "a")).unwrap();
        let second = cache.get_or_insert(&key("m", "h1"), || build(&builds, "b")).unwrap();

        assert!(Arc::ptr_eq(first.artifact(), second.artifact()));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.active_references("m"), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.compiles, 1);
    }

    #[test]
    fn test_changed_hash_replaces_entry() {
        let cache = ExecutionCache::new();
        let builds = AtomicUsize::new(0);

        drop(cache.get_or_insert(&key("m", "h1"), || build(&builds, "a")).unwrap());
        let lease = cache.get_or_insert(&key("m", "h2"), || build(&builds, "b")).unwrap();

        assert_eq!(&*lease, "b");
        assert!(!cache.contains(&key("m", "h1")));
        assert!(cache.contains(&key("m", "h2")));
        assert_eq!(cache.stats().live_entries, 1);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_defers_while_referenced() {
        let cache = ExecutionCache::new();
        let builds = AtomicUsize::new(0);

        let lease = cache.get_or_insert(&key("m", "h1"), || build(&builds, "a")).unwrap();
        assert!(cache.invalidate("m"));

        let stats = cache.stats();
        assert_eq!(stats.live_entries, 0);
        assert_eq!(stats.retired_entries, 1);
        assert_eq!(&*lease, "a");

        drop(lease);
        let stats = cache.stats();
        assert_eq!(stats.retired_entries, 0);
        assert_eq!(stats.evictions, 1);

        drop(cache.get_or_insert(&key("m", "h1"), || build(&builds, "a")).unwrap());
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidate_unknown_module() {
        let cache: ExecutionCache<String> = ExecutionCache::new();
        assert!(!cache.invalidate("absent"));
    }

    #[test]
    fn test_clear_drops_idle_and_retires_active() {
        let cache = ExecutionCache::new();
        let builds = AtomicUsize::new(0);

        drop(cache.get_or_insert(&key("a", "h"), || build(&builds, "a")).unwrap());
        let held = cache.get_or_insert(&key("b", "h"), || build(&builds, "b")).unwrap();

        assert_eq!(cache.clear(), 2);
        let stats = cache.stats();
        assert_eq!(stats.live_entries, 0);
        assert_eq!(stats.retired_entries, 1);

        drop(held);
        assert_eq!(cache.stats().retired_entries, 0);
    }

    #[test]
    fn test_producer_error_leaves_cache_untouched() {
        let cache: ExecutionCache<String> = ExecutionCache::new();
        let result = cache.get_or_insert(&key("m", "h"), || Err::<String, _>("syntax"));
        assert_eq!(result.unwrap_err(), "syntax");
        assert_eq!(cache.stats().live_entries, 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let cache = ExecutionCache::new();
        let builds = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let builds = Arc::clone(&builds);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let lease = cache
                            .get_or_insert(&key("m", "h"), || build(&builds, "a"))
                            .unwrap();
                        assert_eq!(&*lease, "a");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.active_references("m"), 0);
        assert_eq!(cache.stats().live_entries, 1);
    }
}
