//! Conditional caching and record-level invalidation.
//!
//! - [`CacheStore`]: validators (and, client side, bodies) keyed by method,
//!   resource and the request headers named by the resource's `Vary` policy.
//! - [`response_cache_layer`]: serving-side middleware answering
//!   `If-None-Match` with 304 and stamping ETags on fresh 200s.
//! - [`InvalidationRegistry`]: filter tree that tears entries down when a
//!   matching [`MutationEvent`] is published.
//! - [`CacheScope`]: what handlers use to declare `Vary` headers and tie
//!   their response to the records it was built from.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enable_server_cache = true
//! enable_client_cache = true
//! max_body_bytes = 4194304
//! max_redirects = 10
//! ```

mod config;
mod events;
mod keys;
mod lock;
mod middleware;
mod publisher;
mod registry;
mod scope;
mod store;

pub use config::CacheConfig;
pub use events::{
    ACTION_FIELD, Action, FieldValue, Fields, FilterValue, InvalidationFilter, MutationEvent,
    fields,
};
pub use keys::{CacheKey, VaryPolicy, compute_etag, if_none_match};
pub use middleware::{CacheState, is_cacheable, resource_id, response_cache_layer};
pub use publisher::{MutationPublisher, Signals};
pub use registry::{Callback, InvalidationRegistry, SubscriptionId};
pub use scope::{CacheScope, Invalidation};
pub use store::{CacheEntry, CacheStore};

pub(crate) use lock::{rw_read, rw_write};
