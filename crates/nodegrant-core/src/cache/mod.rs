// # Membership Cache
//
// Local mirror of the cluster-membership objects of one category, keyed by
// membership key.
//
// ## Ownership
//
// - Written only by the `Informer` that consumes the membership feed
// - Read synchronously by the controller before every reconciliation pass
// - Snapshots are handed out as `Arc<T>` and never mutated in place
//
// ## Crash Behavior
//
// Nothing is persisted: after a restart the feed's bootstrap listing
// rebuilds the cache from scratch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::traits::Member;

/// Result of replacing the whole cache content with a fresh listing
#[derive(Debug)]
pub struct Replaced<T> {
    /// Every listed object with its previous snapshot, if it was cached
    pub applied: Vec<(Option<Arc<T>>, Arc<T>)>,
    /// Cached objects missing from the listing
    pub removed: Vec<Arc<T>>,
}

/// In-memory membership cache
///
/// Internally synchronized, cheap to clone (clones share the same map).
///
/// # Example
///
/// ```rust
/// use nodegrant_core::cache::MembershipCache;
/// use nodegrant_core::traits::Node;
///
/// let cache = MembershipCache::new();
/// cache.insert(Node::new("node-1", "1"));
///
/// assert!(cache.get("node-1").is_some());
/// assert!(cache.get("node-2").is_none());
/// ```
#[derive(Debug)]
pub struct MembershipCache<T> {
    inner: Arc<RwLock<HashMap<String, Arc<T>>>>,
}

impl<T> Clone for MembershipCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Member> MembershipCache<T> {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // A panic while holding the lock cannot leave the map half-written, so a
    // poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<T>>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<T>>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the current snapshot for `key`
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.read().get(key).cloned()
    }

    /// Whether `key` is currently known
    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Insert or replace an object, returning the previous snapshot
    pub fn insert(&self, item: T) -> (Option<Arc<T>>, Arc<T>) {
        let item = Arc::new(item);
        let previous = self.write().insert(item.key(), Arc::clone(&item));
        (previous, item)
    }

    /// Remove an object, returning the last cached snapshot
    pub fn remove(&self, key: &str) -> Option<Arc<T>> {
        self.write().remove(key)
    }

    /// Replace the whole content with a fresh listing
    pub fn replace_all(&self, items: Vec<T>) -> Replaced<T> {
        let mut map = self.write();
        let mut fresh: HashMap<String, Arc<T>> = HashMap::with_capacity(items.len());
        let mut applied = Vec::with_capacity(items.len());

        for item in items {
            let item = Arc::new(item);
            let key = item.key();
            applied.push((map.get(&key).cloned(), Arc::clone(&item)));
            fresh.insert(key, item);
        }

        let removed = map
            .iter()
            .filter(|(key, _)| !fresh.contains_key(*key))
            .map(|(_, item)| Arc::clone(item))
            .collect();

        *map = fresh;
        Replaced { applied, removed }
    }

    /// All cached keys
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Get the number of cached objects
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl<T: Member> Default for MembershipCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
