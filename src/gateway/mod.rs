//! Gateway server implementation
//!
//! Request flow: request id, security headers, access log, response
//! deadline and authentication wrap the guard ([`guard::RequestGuard`])
//! and forwarder ([`forward::Forwarder`]).

mod access_log;
pub mod auth;
pub mod forward;
pub mod guard;
mod headers;
pub mod request_id;
mod router;
mod server;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

pub use auth::{AuthStrategy, auth_middleware};
pub use guard::{Rejection, RequestGuard};
pub use router::{AppState, create_router};
pub use server::Gateway;

/// JSON error body used for every response the gateway produces itself
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
