//! HTTP router and handlers

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::warn;

use super::{
    access_log::access_log,
    auth::{AuthStrategy, auth_middleware},
    forward::Forwarder,
    guard::RequestGuard,
    headers::security_headers,
    request_id::request_id_middleware,
};
use crate::{service::ServiceKind, tls::ClientIdentity};

/// Shared application state
#[derive(Debug)]
pub struct AppState {
    /// Admission checks and configured services
    pub guard: RequestGuard,
    /// Caller authentication
    pub auth: Arc<AuthStrategy>,
    /// Outbound client, which also enforces the upstream deadline
    pub forwarder: Forwarder,
}

/// Create the router
///
/// Layers, outermost first: panic catcher, request id, security headers,
/// access log, authentication.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/info", get(info_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            auth_middleware,
        ))
        .layer(middleware::from_fn(access_log))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ServiceInfo<'a> {
    url: &'a str,
    whitelist: &'a [String],
}

/// `GET /info` response: configured services only
#[derive(Debug, Serialize, Default)]
struct InfoResponse<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    sonarr: Option<ServiceInfo<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    radarr: Option<ServiceInfo<'a>>,
}

async fn info_handler(State(state): State<Arc<AppState>>) -> Response {
    let services = state.guard.services();
    let describe = |kind| {
        services.get(kind).map(|service| ServiceInfo {
            url: service.raw_url(),
            whitelist: service.patterns(),
        })
    };

    Json(InfoResponse {
        sonarr: describe(ServiceKind::Sonarr),
        radarr: describe(ServiceKind::Radarr),
    })
    .into_response()
}

async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_cn = request
        .extensions()
        .get::<ClientIdentity>()
        .and_then(|identity| identity.common_name.clone());

    match state.guard.admit(request).await {
        Ok(admitted) => {
            let kind = admitted.service.kind();
            let mut response = state
                .forwarder
                .forward(admitted, remote.map(|addr| addr.ip()))
                .await;
            response.extensions_mut().insert(kind);
            response
        }
        Err(rejection) => {
            warn!(
                method = %method,
                path = %path,
                client_cn = client_cn.as_deref().unwrap_or("unknown"),
                remote_addr = %remote.map(|addr| addr.to_string()).unwrap_or_default(),
                reason = rejection.reason(),
                status = rejection.status().as_u16(),
                "Request blocked"
            );
            rejection.into_response()
        }
    }
}
