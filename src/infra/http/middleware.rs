use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::{
    body::Body,
    extract::FromRequestParts,
    http::{HeaderMap, HeaderName, HeaderValue, Request, request::Parts},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;
use crate::cache::{rw_read, rw_write};

pub const HEADER_USER: &str = "x-user";
pub const HEADER_ROLE: &str = "x-role";
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";

/// Headers carried from an inbound request onto every outbound call it makes.
pub const PROPAGATED_HEADERS: [&str; 3] = [HEADER_USER, HEADER_ROLE, HEADER_CORRELATION_ID];

const SOURCE: &str = "infra::http::context";
const HEALTH_PATH: &str = "/health";

/// Ambient header set of one inbound request.
///
/// Clones share state, so an amendment made anywhere in the request (role
/// resolution, for instance) is seen by every later outbound call. Values
/// are only ever added or replaced.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    headers: Arc<RwLock<BTreeMap<String, String>>>,
}

impl RequestContext {
    /// Pick the propagated headers out of an inbound request.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let captured = PROPAGATED_HEADERS
            .iter()
            .filter_map(|name| {
                let value = headers.get(*name)?.to_str().ok()?;
                Some((name.to_string(), value.to_string()))
            })
            .collect();
        Self {
            headers: Arc::new(RwLock::new(captured)),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        rw_read(&self.headers, SOURCE, "get")
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Add or replace one header.
    pub fn set(&self, name: &str, value: impl Into<String>) {
        rw_write(&self.headers, SOURCE, "set").insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn user(&self) -> Option<String> {
        self.get(HEADER_USER)
    }

    pub fn role(&self) -> Option<String> {
        self.get(HEADER_ROLE)
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.get(HEADER_CORRELATION_ID)
    }

    /// Current header set, as seen at this instant.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        rw_read(&self.headers, SOURCE, "snapshot").clone()
    }

    /// Write the current header set onto an outbound request.
    ///
    /// Ambient values replace any the caller set for the same names.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in self.snapshot() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) else {
                continue;
            };
            headers.insert(name, value);
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_else(|| RequestContext::from_headers(&parts.headers)))
    }
}

/// Short random correlation id.
pub fn new_correlation_id() -> String {
    hex::encode(&Uuid::new_v4().as_bytes()[..3])
}

/// Establish the [`RequestContext`] and the request span.
///
/// A correlation id supplied by the caller is kept so one id follows a
/// request across services; otherwise a fresh one is assigned and written
/// back onto the inbound headers.
pub async fn capture_request_context(mut request: Request<Body>, next: Next) -> Response {
    let context = RequestContext::from_headers(request.headers());

    let correlation_id = match context.correlation_id() {
        Some(id) => id,
        None => {
            let id = new_correlation_id();
            context.set(HEADER_CORRELATION_ID, id.clone());
            if let Ok(value) = HeaderValue::from_str(&id) {
                request.headers_mut().insert(HEADER_CORRELATION_ID, value);
            }
            id
        }
    };

    let span = info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    request.extensions_mut().insert(context.clone());
    let mut response = next.run(request).instrument(span).await;
    response.extensions_mut().insert(context);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let mut response = next.run(request).await;
    if uri.path() == HEALTH_PATH {
        return response;
    }

    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();

    if !(status.is_client_error() || status.is_server_error()) {
        info!(
            target: "peercache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            "request served",
        );
        return response;
    }

    let report = response.extensions_mut().remove::<ErrorReport>();
    let (source, messages) = match report {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target: "peercache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            "request failed",
        );
    } else {
        warn!(
            target: "peercache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            "client request error",
        );
    }

    response
}
