//! Request correlation ids and task-local propagation.
//!
//! Every request gets an id. A caller-supplied `X-Request-ID` is kept when
//! it matches `[A-Za-z0-9_-]{1,64}`; otherwise a fresh 32-character hex id
//! is minted. The id is:
//!
//! - written back onto the inbound request, so the upstream sees it,
//! - echoed on the response,
//! - stored in [`REQUEST_ID`] and attached to a `request` tracing span for
//!   the lifetime of the request.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, info_span};
use uuid::Uuid;

/// Correlation header name
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

const MAX_LEN: usize = 64;

tokio::task_local! {
    /// Task-local storage for the current request id.
    ///
    /// Set by [`request_id_middleware`]; read by [`current`].
    pub static REQUEST_ID: String;
}

/// Generate a new request id: 16 random bytes, hex encoded.
#[must_use]
pub fn generate() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether a caller-supplied id may be reused
#[must_use]
pub fn is_valid(id: &str) -> bool {
    (1..=MAX_LEN).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Return the request id set for the current task, or `None` if none is set.
#[must_use]
pub fn current() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// Assign, propagate and echo the request id
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_valid(v))
        .map_or_else(generate, str::to_owned);

    // Only [A-Za-z0-9_-] reaches here, which is always a valid header value
    let value = HeaderValue::from_str(&id).unwrap_or_else(|_| HeaderValue::from_static("invalid"));
    request.headers_mut().insert(X_REQUEST_ID, value.clone());

    let span = info_span!("request", request_id = %id);
    let mut response = REQUEST_ID
        .scope(id, next.run(request))
        .instrument(span)
        .await;

    response.headers_mut().insert(X_REQUEST_ID, value);
    response
}
