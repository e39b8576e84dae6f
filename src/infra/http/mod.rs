mod gateway;
mod middleware;
mod todo;

pub use gateway::{GatewayState, build_gateway_router};
pub use middleware::{
    HEADER_CORRELATION_ID, HEADER_ROLE, HEADER_USER, PROPAGATED_HEADERS, RequestContext,
    capture_request_context, log_responses, new_correlation_id,
};
pub use todo::{TodoState, build_todo_router};

/// Liveness probe; never cached and never logged.
pub(crate) async fn health() -> &'static str {
    "OK"
}
