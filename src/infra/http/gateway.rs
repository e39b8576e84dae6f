use axum::{
    Router,
    body::Body,
    extract::{FromRef, State},
    http::{HeaderValue, Method, Request, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::{
    application::{
        error::AppError,
        role::{list_id_from_path, resolve_role},
    },
    cache::resource_id,
    domain::types::Role,
    infra::client::{CachingHttpClient, ClientError, PeerSession},
};

use super::{
    health,
    middleware::{HEADER_ROLE, RequestContext, capture_request_context, log_responses},
};

#[derive(Clone)]
pub struct GatewayState {
    pub client: CachingHttpClient,
    /// Todo service base URL, ending in `/`.
    pub todo_url: Url,
}

impl FromRef<GatewayState> for CachingHttpClient {
    fn from_ref(state: &GatewayState) -> Self {
        state.client.clone()
    }
}

pub fn build_gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/lists", get(forward).post(post_lists))
        .route("/lists/{list_id}", any(forward))
        .route("/lists/{list_id}/collaborators", any(forward))
        .route("/lists/{list_id}/entries", any(forward))
        .route("/lists/{list_id}/entries/{entry_id}", any(forward))
        .route("/health", get(health))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, resolve_caller_role))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(capture_request_context))
        .layer(middleware::from_fn(strip_inbound_role))
}

/// Roles are resolved here; callers do not get to claim one.
async fn strip_inbound_role(mut request: Request<Body>, next: Next) -> Response {
    request.headers_mut().remove(HEADER_ROLE);
    next.run(request).await
}

/// Amend the request context with the caller's role on the addressed list.
async fn resolve_caller_role(
    State(state): State<GatewayState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(list_id) = list_id_from_path(request.uri().path()).map(str::to_string) else {
        return next.run(request).await;
    };
    let context = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::from_headers(request.headers()));
    let Some(email) = context.user() else {
        return next.run(request).await;
    };

    let session = state.client.session(context.clone());
    match resolve_role(&session, &state.todo_url, &list_id, &email).await {
        Ok(Some(role)) => {
            debug!(list_id, role = %role, "caller role resolved");
            context.set(HEADER_ROLE, role.as_str());
            request
                .headers_mut()
                .insert(HEADER_ROLE, HeaderValue::from_static(role.as_str()));
        }
        Ok(None) => {}
        Err(err) => return err.into_response(),
    }

    next.run(request).await
}

fn upstream_url(base: &Url, target: &str) -> Result<Url, ClientError> {
    base.join(target.trim_start_matches('/'))
        .map_err(|source| ClientError::InvalidUrl {
            url: target.to_string(),
            source,
        })
}

/// Relay a request to the todo service and answer with its final response.
async fn forward(
    State(state): State<GatewayState>,
    session: PeerSession,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, AppError> {
    let url = upstream_url(&state.todo_url, &resource_id(&uri))?;
    let body = (!body.is_empty()).then_some(body);

    let response = session
        .send(method, url.as_str(), body)
        .await?
        .error_for_status()?;
    Ok(response.into_response())
}

/// Create a list, then fetch it as its new owner.
async fn post_lists(
    State(state): State<GatewayState>,
    session: PeerSession,
    body: Bytes,
) -> Result<Response, AppError> {
    let url = upstream_url(&state.todo_url, "lists")?;
    let created = session
        .send(Method::POST, url.as_str(), Some(body))
        .await?
        .error_for_status()?;

    let location = created
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let Some(location) = location else {
        return Ok(created.into_response());
    };

    let target = upstream_url(&state.todo_url, &location)?;
    session.context().set(HEADER_ROLE, Role::Owner.as_str());
    let list = session.get(target.as_str()).await?.error_for_status()?;

    let mut response = list.into_response();
    *response.status_mut() = StatusCode::CREATED;
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}
