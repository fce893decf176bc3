//! Per-key memoization of projection rows (component C1).
//!
//! Two ready-made variants are provided — [`PassthroughCache`] (the default;
//! no state to invalidate) and [`InMemoryCache`] (a capacity-bounded map that
//! must be cleared on batch abort, per spec §3/§5). Any user type
//! implementing [`ProjectionCache`] is admissible.

use crate::model::ProjectionEntity;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

/// Boxed, already-erased loader passed to [`ProjectionCache::get_or_load`].
///
/// Erased at the call site (in `MapDispatcher`) so the trait itself stays
/// free of a generic method parameter and remains object-safe.
pub type Loader<'a, P> =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Option<P>> + Send + 'a>> + Send + 'a>;

/// Capability set `{get_or_load, add, remove, clear}` a cache implementation
/// provides. Not thread-safe across *concurrent* batches — see spec §5 — but
/// `&self` methods so one cache can be shared read-mostly within a batch.
pub trait ProjectionCache<P: ProjectionEntity>: Send + Sync {
    /// Return the cached value for `key`, invoking `loader` on a miss.
    ///
    /// `loader` always runs on a miss, even for a passthrough cache; a
    /// successful in-memory cache memoizes the result for the remainder of
    /// the batch.
    fn get_or_load<'a>(
        &'a self,
        key: &'a P::Key,
        loader: Loader<'a, P>,
    ) -> Pin<Box<dyn Future<Output = Option<P>> + Send + 'a>>;

    /// Record a freshly created or updated value under `key`.
    fn put(&self, key: &P::Key, value: P);

    /// Invalidate a single key (used on delete).
    fn remove(&self, key: &P::Key);

    /// Invalidate every entry. Must be called on any batch abort so that
    /// in-memory state cannot diverge from a rolled-back store transaction.
    fn clear(&self);
}

/// The safe default: every `get_or_load` invokes the loader; `add`/`remove`/
/// `clear` are no-ops because there is no state to invalidate.
#[derive(Debug, Default)]
pub struct PassthroughCache;

impl<P: ProjectionEntity> ProjectionCache<P> for PassthroughCache {
    fn get_or_load<'a>(
        &'a self,
        _key: &'a P::Key,
        loader: Loader<'a, P>,
    ) -> Pin<Box<dyn Future<Output = Option<P>> + Send + 'a>> {
        loader()
    }

    fn put(&self, _key: &P::Key, _value: P) {}
    fn remove(&self, _key: &P::Key) {}
    fn clear(&self) {}
}

/// An in-memory map, with an optional capacity bound, that memoizes
/// successful loads and wipes on `clear()`.
///
/// When `capacity` is `Some(n)` and a new entry would exceed it, an
/// arbitrary existing entry is evicted first (this cache is an optimization
/// over re-fetching, not a correctness-bearing store — the row of truth is
/// always the backing [`crate::store::StoreSession`]).
pub struct InMemoryCache<P: ProjectionEntity> {
    entries: RwLock<HashMap<String, P>>,
    capacity: Option<usize>,
}

impl<P: ProjectionEntity> InMemoryCache<P> {
    /// An unbounded in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: None,
        }
    }

    /// An in-memory cache that evicts once it would exceed `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    #[must_use]
    fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or_default()
    }
}

impl<P: ProjectionEntity> Default for InMemoryCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProjectionEntity> ProjectionCache<P> for InMemoryCache<P> {
    fn get_or_load<'a>(
        &'a self,
        key: &'a P::Key,
        loader: Loader<'a, P>,
    ) -> Pin<Box<dyn Future<Output = Option<P>> + Send + 'a>> {
        let row_key = P::row_key(key);
        Box::pin(async move {
            if let Some(hit) = self
                .entries
                .read()
                .ok()
                .and_then(|m| m.get(&row_key).cloned())
            {
                return Some(hit);
            }

            let loaded = loader().await?;
            if let Ok(mut guard) = self.entries.write() {
                if self.capacity.is_some_and(|cap| guard.len() >= cap) && !guard.contains_key(&row_key)
                {
                    if let Some(evict) = guard.keys().next().cloned() {
                        guard.remove(&evict);
                    }
                }
                guard.insert(row_key, loaded.clone());
            }
            Some(loaded)
        })
    }

    fn put(&self, key: &P::Key, value: P) {
        if let Ok(mut guard) = self.entries.write() {
            let row_key = P::row_key(key);
            if self.capacity.is_some_and(|cap| guard.len() >= cap) && !guard.contains_key(&row_key)
            {
                if let Some(evict) = guard.keys().next().cloned() {
                    guard.remove(&evict);
                }
            }
            guard.insert(row_key, value);
        }
    }

    fn remove(&self, key: &P::Key) {
        if let Ok(mut guard) = self.entries.write() {
            guard.remove(&P::row_key(key));
        }
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.entries.write() {
            guard.clear();
        }
    }
}
