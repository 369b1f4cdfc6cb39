//! Shared fixtures: a recording upstream and gateway configs pointing at it

#![allow(dead_code)]

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use arr_gateway::config::{AuthConfig, Config, ServerConfig, ServiceConfig, UpstreamConfig};
use axum::{
    Json, Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

pub const GATEWAY_KEY: &str = "k1";
pub const SONARR_SECRET: &str = "sonarr-secret";
pub const MAX_BODY: u64 = 64;

pub const WHITELIST: &[&str] = &[
    "GET:^/api/v3/series$",
    "^/api/v3/command$",
    "^/api/v3/tag/.+$",
    "GET,DELETE:^/api/v3/queue/\\d+$",
    "GET:^/ro$",
    "^/any$",
    "GET:^/redirect$",
    "GET:^/slow$",
];

/// Start an upstream that answers every request with a JSON description
/// of what it received.
///
/// `/redirect` answers 302 and `/slow` waits two seconds first.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let app = Router::new().fallback(echo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing is listening on
pub async fn dead_upstream() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn echo(request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_owned();

    if path.ends_with("/redirect") {
        return (StatusCode::FOUND, [(header::LOCATION, "/elsewhere")]).into_response();
    }
    if path.ends_with("/slow") {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let body = to_bytes(body, usize::MAX).await.unwrap_or_default();
    let headers: BTreeMap<String, String> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    (
        [("x-upstream", "echo"), ("cache-control", "public, max-age=60")],
        Json(json!({
            "method": parts.method.as_str(),
            "path": path,
            "query": parts.uri.query(),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        })),
    )
        .into_response()
}

/// apikey-mode config with Sonarr pointing at `upstream` and Radarr unconfigured
pub fn config(upstream: &str) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_body_size: MAX_BODY,
            read_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        },
        auth: AuthConfig {
            api_key: GATEWAY_KEY.to_string(),
            ..AuthConfig::default()
        },
        upstream: UpstreamConfig {
            connect_timeout: Duration::from_secs(2),
            response_header_timeout: Duration::from_millis(500),
            ..UpstreamConfig::default()
        },
        sonarr: ServiceConfig {
            url: upstream.to_string(),
            api_key: SONARR_SECRET.to_string(),
            whitelist: WHITELIST.iter().map(ToString::to_string).collect(),
        },
        ..Config::default()
    }
}

/// Read a response body as JSON
pub async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
