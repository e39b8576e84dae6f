//! Conditional-GET response interceptor.
//!
//! Answers `If-None-Match` requests whose validator matches the stored entry
//! with a bare 304, and stamps a content-derived `ETag` on every cacheable
//! response the handler produces.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, header},
    middleware::Next,
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::{
    CacheConfig,
    keys::{compute_etag, if_none_match},
    scope::CacheScope,
    store::{CacheEntry, CacheStore},
};

pub(crate) const METRIC_SERVER_HIT: &str = "peercache_server_hit_total";
pub(crate) const METRIC_SERVER_MISS: &str = "peercache_server_miss_total";
pub(crate) const METRIC_SERVER_STORE: &str = "peercache_server_store_total";

/// Shared cache state for the middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub store: Arc<CacheStore>,
}

impl CacheState {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: Arc::new(CacheStore::new()),
        }
    }
}

/// Middleware implementing the conditional-GET contract.
///
/// Only a fully stored entry whose etag the client already holds produces a
/// 304. Everything else reaches the handler; qualifying 200s are buffered,
/// hashed and stored.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.config.enable_server_cache {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let resource = resource_id(request.uri());
    let request_headers = request.headers().clone();

    let hit = cache
        .store
        .get(&method, &resource, &request_headers)
        .filter(|entry| if_none_match(&request_headers, &entry.etag));
    if let Some(entry) = hit {
        counter!(METRIC_SERVER_HIT).increment(1);
        debug!(cache = "server", outcome = "hit", etag = %entry.etag, "not modified");
        return not_modified(entry);
    }

    counter!(METRIC_SERVER_MISS).increment(1);
    debug!(cache = "server", outcome = "miss", "executing handler");

    let scope = CacheScope::new(
        Arc::clone(&cache.store),
        method.clone(),
        resource.clone(),
        request_headers.clone(),
    );
    request.extensions_mut().insert(scope.clone());

    let mut response = next.run(request).await;
    apply_vary(&scope, response.headers_mut());

    if !is_cacheable(&method, response.status(), response.headers()) {
        scope.cancel();
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match buffer_body(body, cache.config.max_body_bytes).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::Overflow { head, rest } => {
            warn!(
                cache = "server",
                limit = cache.config.max_body_bytes,
                "response body over buffering limit, forwarding uncached"
            );
            scope.cancel();
            return Response::from_parts(parts, chain(head, rest));
        }
        Buffered::Failed { received, error } => {
            warn!(
                cache = "server",
                error = %error,
                received = received.len(),
                "response body read failed, forwarding what was received"
            );
            scope.cancel();
            parts.headers.remove(header::CONTENT_LENGTH);
            return Response::from_parts(parts, Body::from(received));
        }
    };

    let etag = compute_etag(&bytes);
    match HeaderValue::from_str(&etag) {
        Ok(value) => {
            parts.headers.append(header::ETAG, value);
        }
        Err(_) => {
            scope.cancel();
            return Response::from_parts(parts, Body::from(bytes));
        }
    }

    let entry = CacheEntry {
        etag: etag.clone(),
        status: parts.status,
        headers: parts.headers.clone(),
        body: None,
    };
    cache.store.store_guarded(
        &method,
        &resource,
        &request_headers,
        entry,
        scope.take_invalidations(),
    );
    counter!(METRIC_SERVER_STORE).increment(1);
    debug!(cache = "server", outcome = "store", etag = %etag, "response cached");

    Response::from_parts(parts, Body::from(bytes))
}

/// Path plus query string.
pub fn resource_id(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// A 200 is cacheable when it answers a GET or announces a `Vary` header.
pub fn is_cacheable(method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
    status == StatusCode::OK && (method == Method::GET || headers.contains_key(header::VARY))
}

fn apply_vary(scope: &CacheScope, headers: &mut HeaderMap) {
    if headers.contains_key(header::VARY) {
        return;
    }
    let Some(policy) = scope.vary_policy().filter(|policy| !policy.is_empty()) else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&policy.to_header_value()) {
        headers.insert(header::VARY, value);
    }
}

fn not_modified(entry: CacheEntry) -> Response {
    let mut headers = entry.headers;
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    *response.headers_mut() = headers;
    response
}

pub(crate) enum Buffered {
    Complete(Bytes),
    /// Limit exceeded; `head` holds what was read, `rest` the unread remainder.
    Overflow {
        head: Bytes,
        rest: Body,
    },
    Failed {
        received: Bytes,
        error: axum::Error,
    },
}

/// Read a body to the end, up to `limit` bytes. Trailers are dropped.
pub(crate) async fn buffer_body(mut body: Body, limit: usize) -> Buffered {
    let mut buf = BytesMut::new();

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                buf.extend_from_slice(&data);
                if buf.len() > limit {
                    return Buffered::Overflow {
                        head: buf.freeze(),
                        rest: body,
                    };
                }
            }
            Err(error) => {
                return Buffered::Failed {
                    received: buf.freeze(),
                    error,
                };
            }
        }
    }

    Buffered::Complete(buf.freeze())
}

pub(crate) fn chain(head: Bytes, rest: Body) -> Body {
    let head = stream::once(async move { Ok::<_, axum::Error>(head) });
    Body::from_stream(head.chain(rest.into_data_stream()))
}
