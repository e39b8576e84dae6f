//! Outbound HTTP client with validator caching.
//!
//! Every call carries the caller's [`RequestContext`] headers. When the
//! client-local store holds an entry for the target, its etag goes out as
//! `If-None-Match` and a 304 answer is replaced by the stored response, so
//! callers only ever see full payloads.
//!
//! Redirects are followed here rather than inside reqwest, so each hop goes
//! through the same store-and-revalidate path. A POST answered with 303
//! therefore caches the GET it redirects to.

use std::sync::Arc;

use axum::{
    Json,
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use metrics::counter;
use reqwest::{Client, Url, redirect};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::error::ErrorReport;
use crate::cache::{CacheConfig, CacheStore, is_cacheable};
use crate::infra::http::RequestContext;

pub(crate) const METRIC_CLIENT_STORE: &str = "peercache_client_store_total";
pub(crate) const METRIC_CLIENT_REVALIDATED: &str = "peercache_client_revalidated_total";

const SOURCE: &str = "infra::client";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream responded {status}: {message}")]
    Upstream { status: StatusCode, message: String },
    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("gave up after {limit} redirects")]
    TooManyRedirects { limit: usize },
    #[error("failed to decode upstream response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// Status surfaced to our own caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Upstream { status, .. } => *status,
            Self::Transport(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::Upstream { message, .. } => message.clone(),
            Self::Transport(_) => "Upstream service unavailable".to_string(),
            Self::InvalidUrl { .. } => "Upstream address is invalid".to_string(),
            Self::TooManyRedirects { .. } => "Upstream redirected too many times".to_string(),
            Self::Decode(_) => "Upstream response could not be decoded".to_string(),
        }
    }
}

impl IntoResponse for ClientError {
    fn into_response(self) -> Response {
        let status = self.status();
        let report = ErrorReport::from_error(SOURCE, status, &self);
        let mut response = (status, Json(json!({ "message": self.public_message() }))).into_response();
        report.attach(&mut response);
        response
    }
}

/// Shared outbound client. Cheap to clone.
#[derive(Clone)]
pub struct CachingHttpClient {
    http: Client,
    cache: Arc<CacheStore>,
    config: CacheConfig,
}

impl CachingHttpClient {
    pub fn new(config: CacheConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .user_agent(concat!("peercache/", env!("CARGO_PKG_VERSION")))
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self::with_client(http, config))
    }

    /// Wrap an existing client. It must not follow redirects itself.
    pub fn with_client(http: Client, config: CacheConfig) -> Self {
        Self {
            http,
            cache: Arc::new(CacheStore::new()),
            config,
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Bind the client to one request's ambient headers.
    pub fn session(&self, context: RequestContext) -> PeerSession {
        PeerSession {
            client: self.clone(),
            context,
        }
    }
}

/// A full, possibly replayed, upstream response.
#[derive(Debug, Clone)]
pub struct PeerResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
}

impl PeerResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get(header::ETAG)?.to_str().ok()
    }

    /// Turn 4xx/5xx answers into [`ClientError::Upstream`].
    pub fn error_for_status(self) -> Result<Self, ClientError> {
        if self.status.is_client_error() || self.status.is_server_error() {
            return Err(ClientError::Upstream {
                status: self.status,
                message: upstream_message(&self.body, self.status),
            });
        }
        Ok(self)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl IntoResponse for PeerResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(axum::body::Body::from(self.body));
        *response.status_mut() = self.status;
        for name in [header::CONTENT_TYPE, header::LOCATION] {
            if let Some(value) = self.headers.get(&name) {
                response.headers_mut().insert(name, value.clone());
            }
        }
        response
    }
}

/// Message of an error answer: the JSON `message` or `detail` field, else the text body.
fn upstream_message(body: &Bytes, status: StatusCode) -> String {
    let parsed = serde_json::from_slice::<serde_json::Value>(body).ok();
    let field = parsed.as_ref().and_then(|value| {
        ["message", "detail"]
            .iter()
            .find_map(|name| value.get(*name)?.as_str().map(str::to_string))
    });
    match field {
        Some(message) => message,
        None if body.is_empty() => status
            .canonical_reason()
            .unwrap_or("upstream error")
            .to_string(),
        None => String::from_utf8_lossy(body).into_owned(),
    }
}

/// [`CachingHttpClient`] bound to the [`RequestContext`] of one inbound request.
#[derive(Clone)]
pub struct PeerSession {
    client: CachingHttpClient,
    context: RequestContext,
}

impl<S> FromRequestParts<S> for PeerSession
where
    S: Send + Sync,
    CachingHttpClient: FromRef<S>,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let context = RequestContext::from_request_parts(parts, state)
            .await
            .unwrap_or_default();
        Ok(CachingHttpClient::from_ref(state).session(context))
    }
}

impl PeerSession {
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub async fn get(&self, url: &str) -> Result<PeerResponse, ClientError> {
        self.send(Method::GET, url, None).await
    }

    pub async fn delete(&self, url: &str) -> Result<PeerResponse, ClientError> {
        self.send(Method::DELETE, url, None).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<PeerResponse, ClientError> {
        let body = serde_json::to_vec(body)?;
        self.send(Method::POST, url, Some(Bytes::from(body))).await
    }

    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<PeerResponse, ClientError> {
        let body = serde_json::to_vec(body)?;
        self.send(Method::PATCH, url, Some(Bytes::from(body))).await
    }

    /// Send a request, following redirects. A body is sent as JSON.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
    ) -> Result<PeerResponse, ClientError> {
        let mut url = Url::parse(url).map_err(|source| ClientError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let mut method = method;
        let mut body = body;
        let limit = self.client.config.max_redirects;

        for _ in 0..=limit {
            let response = self.exchange(&method, &url, body.clone()).await?;

            let Some(location) = redirect_location(&response) else {
                return Ok(response);
            };
            let next = url
                .join(location)
                .map_err(|source| ClientError::InvalidUrl {
                    url: location.to_string(),
                    source,
                })?;

            if switches_to_get(response.status, &method) {
                method = Method::GET;
                body = None;
            }
            debug!(
                cache = "client",
                status = response.status.as_u16(),
                from = %url,
                to = %next,
                "following redirect"
            );
            url = next;
        }

        Err(ClientError::TooManyRedirects { limit })
    }

    async fn exchange(
        &self,
        method: &Method,
        url: &Url,
        body: Option<Bytes>,
    ) -> Result<PeerResponse, ClientError> {
        let caching = self.client.config.enable_client_cache;
        let cache = &self.client.cache;
        let resource = url.as_str();

        let mut headers = HeaderMap::new();
        if body.is_some() {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        self.context.apply(&mut headers);

        let mut outbound = headers.clone();
        if caching {
            let validator = cache
                .get(method, resource, &headers)
                .and_then(|entry| HeaderValue::from_str(&entry.etag).ok());
            if let Some(etag) = validator {
                outbound.insert(header::IF_NONE_MATCH, etag);
            }
        }

        let mut request = self
            .client
            .http
            .request(method.clone(), url.clone())
            .headers(outbound);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let bytes = response.bytes().await?;

        if !caching {
            return Ok(PeerResponse {
                status,
                headers: response_headers,
                body: bytes,
                url: url.clone(),
            });
        }

        if status == StatusCode::NOT_MODIFIED {
            match cache.get(method, resource, &headers) {
                Some(entry) => {
                    counter!(METRIC_CLIENT_REVALIDATED).increment(1);
                    debug!(cache = "client", outcome = "splice", url = %url, etag = %entry.etag, "replaying cached response");
                    return Ok(PeerResponse {
                        status: entry.status,
                        headers: entry.headers,
                        body: entry.body.unwrap_or_default(),
                        url: url.clone(),
                    });
                }
                None => {
                    warn!(cache = "client", url = %url, "304 without a stored entry");
                }
            }
        } else if is_cacheable(method, status, &response_headers) {
            let etag = response_headers
                .get(header::ETAG)
                .and_then(|value| value.to_str().ok());
            if let Some(etag) = etag {
                cache.store(
                    method,
                    resource,
                    &headers,
                    &response_headers,
                    etag,
                    status,
                    Some(bytes.clone()),
                );
                counter!(METRIC_CLIENT_STORE).increment(1);
                debug!(cache = "client", outcome = "store", url = %url, etag, "upstream response cached");
            }
        }

        Ok(PeerResponse {
            status,
            headers: response_headers,
            body: bytes,
            url: url.clone(),
        })
    }
}

fn redirect_location(response: &PeerResponse) -> Option<&str> {
    if !response.status.is_redirection() || response.status == StatusCode::NOT_MODIFIED {
        return None;
    }
    response.headers.get(header::LOCATION)?.to_str().ok()
}

/// 303 always continues as GET; 301 and 302 do so after a POST.
fn switches_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => *method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => *method == Method::POST,
        _ => false,
    }
}
