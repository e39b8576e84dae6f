//! Handler-side cache registration.
//!
//! The response cache layer places a [`CacheScope`] in the request
//! extensions before running the handler. A handler extracts it to declare
//! which request headers its response varies on and to tie the resulting
//! cache entry to the records it was built from:
//!
//! ```ignore
//! async fn get_lists(scope: CacheScope, State(state): State<TodoState>) -> Json<Vec<TodoList>> {
//!     let lists = state.lists.select(|list| ...);
//!     let invalidation = scope.vary_on(["x-user"]);
//!     for list in &lists {
//!         invalidation.subscribe(&state.signals.model("lists"), list.filter());
//!     }
//!     Json(lists)
//! }
//! ```
//!
//! Outside the layer the extractor yields a detached scope whose operations
//! do nothing.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, Method, request::Parts};
use tracing::debug;

use super::events::InvalidationFilter;
use super::keys::{CacheKey, VaryPolicy};
use super::lock::mutex_lock;
use super::registry::{InvalidationRegistry, SubscriptionId};
use super::store::CacheStore;

const SOURCE: &str = "cache::scope";

struct ScopeInner {
    store: Arc<CacheStore>,
    method: Method,
    resource: String,
    headers: HeaderMap,
    vary: Mutex<Option<VaryPolicy>>,
    issued: Mutex<Vec<Invalidation>>,
}

/// Per-request handle onto the serving cache.
#[derive(Clone, Default)]
pub struct CacheScope {
    inner: Option<Arc<ScopeInner>>,
}

impl CacheScope {
    pub(crate) fn new(
        store: Arc<CacheStore>,
        method: Method,
        resource: String,
        headers: HeaderMap,
    ) -> Self {
        Self {
            inner: Some(Arc::new(ScopeInner {
                store,
                method,
                resource,
                headers,
                vary: Mutex::new(None),
                issued: Mutex::new(Vec::new()),
            })),
        }
    }

    /// A scope not attached to any cache.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }

    /// Declare the request headers this response varies on.
    ///
    /// The layer emits them as the `Vary` header unless the handler set one
    /// itself. The returned handle targets the key the response will be
    /// stored under.
    pub fn vary_on<I, S>(&self, names: I) -> Invalidation
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(inner) = &self.inner else {
            return Invalidation::default();
        };

        let policy = VaryPolicy::new(names);
        let key = CacheKey::new(&inner.method, &inner.resource, &inner.headers, &policy);
        *mutex_lock(&inner.vary, SOURCE, "vary_on") = Some(policy);

        let invalidation = Invalidation::new(Arc::downgrade(&inner.store), key);
        mutex_lock(&inner.issued, SOURCE, "vary_on").push(invalidation.clone());
        invalidation
    }

    /// Invalidation handle for a response that does not vary.
    pub fn invalidation(&self) -> Invalidation {
        self.vary_on(std::iter::empty::<&str>())
    }

    pub(crate) fn vary_policy(&self) -> Option<VaryPolicy> {
        let inner = self.inner.as_ref()?;
        mutex_lock(&inner.vary, SOURCE, "vary_policy").clone()
    }

    /// Hand over the handles issued so far; the store keeps them with the entry.
    pub(crate) fn take_invalidations(&self) -> Vec<Invalidation> {
        self.inner
            .as_ref()
            .map(|inner| std::mem::take(&mut *mutex_lock(&inner.issued, SOURCE, "take")))
            .unwrap_or_default()
    }

    /// Drop every subscription the handler made. Used when nothing is stored.
    pub(crate) fn cancel(&self) {
        for invalidation in self.take_invalidations() {
            invalidation.cancel();
        }
    }
}

impl<S> FromRequestParts<S> for CacheScope
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<CacheScope>()
            .cloned()
            .unwrap_or_default())
    }
}

struct InvalidationInner {
    store: Weak<CacheStore>,
    key: CacheKey,
    fired: AtomicBool,
    subscriptions: Mutex<Vec<(Weak<InvalidationRegistry>, SubscriptionId)>>,
}

impl InvalidationInner {
    fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(store) = self.store.upgrade() {
            store.invalidate(&self.key);
        }
        self.release();

        debug!(
            cache = "server",
            outcome = "invalidate",
            resource = self.key.resource(),
            "dependent record changed"
        );
    }

    fn release(&self) {
        let siblings = std::mem::take(&mut *mutex_lock(&self.subscriptions, SOURCE, "release"));
        for (registry, id) in siblings {
            if let Some(registry) = registry.upgrade() {
                registry.unsubscribe(id);
            }
        }
    }
}

/// Ties one cache key to any number of record filters.
///
/// The first matching mutation removes the entry and cancels the remaining
/// subscriptions of this handle.
#[derive(Clone, Default)]
pub struct Invalidation {
    inner: Option<Arc<InvalidationInner>>,
}

impl Invalidation {
    fn new(store: Weak<CacheStore>, key: CacheKey) -> Self {
        Self {
            inner: Some(Arc::new(InvalidationInner {
                store,
                key,
                fired: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
            })),
        }
    }

    /// Invalidate when a record matching `filter` changes in `registry`.
    pub fn subscribe(
        &self,
        registry: &Arc<InvalidationRegistry>,
        filter: InvalidationFilter,
    ) -> &Self {
        let Some(inner) = &self.inner else {
            return self;
        };
        if inner.fired.load(Ordering::SeqCst) {
            return self;
        }

        let target = Arc::clone(inner);
        let id = registry.subscribe(&filter, Arc::new(move || target.fire()));
        mutex_lock(&inner.subscriptions, SOURCE, "subscribe").push((Arc::downgrade(registry), id));
        self
    }

    /// Key this handle invalidates; `None` when detached.
    pub fn key(&self) -> Option<&CacheKey> {
        self.inner.as_ref().map(|inner| &inner.key)
    }

    /// Withdraw every subscription without touching the entry.
    ///
    /// A cancelled handle never fires and ignores later subscriptions.
    pub fn cancel(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.release();
    }

    pub fn has_fired(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.fired.load(Ordering::SeqCst))
    }
}
