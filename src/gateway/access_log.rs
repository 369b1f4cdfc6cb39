//! Per-request access log
//!
//! One `info` entry per completed request, emitted under the
//! `access_log` target so it can be filtered separately.

use std::{net::SocketAddr, time::Instant};

use axum::{body::Body, extract::ConnectInfo, http::Request, middleware::Next, response::Response};
use tracing::info;

use crate::{service::ServiceKind, tls::ClientIdentity};

/// Log method, path, status, latency and caller details for each request
pub async fn access_log(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let client_cn = request
        .extensions()
        .get::<ClientIdentity>()
        .and_then(|identity| identity.common_name.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let response = next.run(request).await;

    let service = response
        .extensions()
        .get::<ServiceKind>()
        .map_or("-", |kind| kind.name());
    let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    info!(
        target: "access_log",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        service = service,
        client_cn = %client_cn,
        remote_addr = %remote_addr,
        latency_ms = latency_ms,
        "Request completed"
    );

    response
}
