//! In-memory cache of validators (and, client side, bodies).
//!
//! One lock guards both the entries and the per-resource Vary policies so
//! that every `get`/`store` sees a consistent pair. Serving-side entries
//! also own the invalidation handles that were registered while rendering
//! them; replacing or dropping the entry cancels those handles.

use std::collections::HashMap;
use std::sync::RwLock;

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use tracing::debug;

use super::keys::{CacheKey, VaryPolicy};
use super::lock::{rw_read, rw_write};
use super::scope::Invalidation;

const SOURCE: &str = "cache::store";

/// A stored representation.
///
/// `body` is kept only where bytes must be replayed (the outbound client);
/// the serving side needs nothing but the validator and headers for a 304.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub etag: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, CacheEntry>,
    vary: HashMap<String, VaryPolicy>,
    guards: HashMap<CacheKey, Vec<Invalidation>>,
}

impl Inner {
    fn key(&self, method: &Method, resource: &str, headers: &HeaderMap) -> CacheKey {
        let empty = VaryPolicy::default();
        let policy = self.vary.get(resource).unwrap_or(&empty);
        CacheKey::new(method, resource, headers, policy)
    }
}

/// Validator cache keyed by method, resource and Vary-selected headers.
///
/// Entries are never evicted; they are replaced by the next fresh write or
/// removed by invalidation. When a resource's Vary policy changes shape,
/// entries stored under the old shape stay in memory but can no longer be
/// reached.
#[derive(Default)]
pub struct CacheStore {
    inner: RwLock<Inner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry for a request under the resource's current policy.
    pub fn get(&self, method: &Method, resource: &str, headers: &HeaderMap) -> Option<CacheEntry> {
        let inner = rw_read(&self.inner, SOURCE, "get");
        let key = inner.key(method, resource, headers);
        inner.entries.get(&key).cloned()
    }

    /// Record a fresh representation.
    ///
    /// The response's `Vary` header (or its absence) replaces the resource's
    /// policy before the key is built, so the entry is filed under the shape
    /// the response just announced.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        method: &Method,
        resource: &str,
        request_headers: &HeaderMap,
        response_headers: &HeaderMap,
        etag: &str,
        status: StatusCode,
        body: Option<Bytes>,
    ) -> CacheKey {
        let entry = CacheEntry {
            etag: etag.to_string(),
            status,
            headers: response_headers.clone(),
            body,
        };
        self.store_guarded(method, resource, request_headers, entry, Vec::new())
    }

    /// Like [`store`](Self::store), keeping `guards` alive with the entry.
    ///
    /// Guards of the entry being replaced are cancelled.
    pub(crate) fn store_guarded(
        &self,
        method: &Method,
        resource: &str,
        request_headers: &HeaderMap,
        entry: CacheEntry,
        guards: Vec<Invalidation>,
    ) -> CacheKey {
        let policy = VaryPolicy::from_headers(&entry.headers).unwrap_or_default();
        let key = CacheKey::new(method, resource, request_headers, &policy);
        let etag = entry.etag.clone();

        let replaced = {
            let mut inner = rw_write(&self.inner, SOURCE, "store");
            inner.vary.insert(resource.to_string(), policy);
            inner.entries.insert(key.clone(), entry);
            if guards.is_empty() {
                inner.guards.remove(&key)
            } else {
                inner.guards.insert(key.clone(), guards)
            }
        };
        cancel_all(replaced);

        debug!(resource, etag, "cache entry stored");
        key
    }

    /// Key a request maps to under the resource's current policy.
    pub fn key_for(&self, method: &Method, resource: &str, headers: &HeaderMap) -> CacheKey {
        rw_read(&self.inner, SOURCE, "key_for").key(method, resource, headers)
    }

    /// Current Vary policy of a resource, if a response has been stored.
    pub fn policy(&self, resource: &str) -> Option<VaryPolicy> {
        rw_read(&self.inner, SOURCE, "policy")
            .vary
            .get(resource)
            .cloned()
    }

    /// Drop one entry. Returns whether anything was removed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let (removed, guards) = {
            let mut inner = rw_write(&self.inner, SOURCE, "invalidate");
            (inner.entries.remove(key).is_some(), inner.guards.remove(key))
        };
        cancel_all(guards);
        if removed {
            debug!(resource = key.resource(), "cache entry invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        let guards = {
            let mut inner = rw_write(&self.inner, SOURCE, "clear");
            inner.entries.clear();
            inner.vary.clear();
            std::mem::take(&mut inner.guards)
        };
        for handles in guards.into_values() {
            cancel_all(Some(handles));
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs outside the store lock; cancelling takes registry locks.
fn cancel_all(guards: Option<Vec<Invalidation>>) {
    for invalidation in guards.into_iter().flatten() {
        invalidation.cancel();
    }
}
