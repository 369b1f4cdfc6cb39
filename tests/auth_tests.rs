//! End-to-end authentication tests
//!
//! Tests the full auth flow including:
//! - API key in header and query parameter
//! - HTTP Basic credentials
//! - failure responses

mod common;

use arr_gateway::{config::AuthConfig, gateway::Gateway};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use common::{config, json_body, spawn_echo_upstream};
use serde_json::json;
use tower::ServiceExt;

async fn apikey_gateway() -> Router {
    let addr = spawn_echo_upstream().await;
    Gateway::new(config(&format!("http://{addr}")))
        .unwrap()
        .router()
}

async fn basic_gateway() -> Router {
    let addr = spawn_echo_upstream().await;
    let mut config = config(&format!("http://{addr}"));
    config.auth = AuthConfig {
        mode: "basic".to_string(),
        basic_user: "admin".to_string(),
        basic_pass: "hunter2".to_string(),
        ..AuthConfig::default()
    };
    Gateway::new(config).unwrap().router()
}

fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
}

fn with_header(uri: &str, name: &str, value: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(name, value)
        .body(Body::empty())
        .unwrap()
}

/// apikey mode, key `k1`: header `k1` proceeds, `k2` is refused
#[tokio::test]
async fn test_api_key_header() {
    let app = apikey_gateway().await;

    let ok = app
        .clone()
        .oneshot(with_header("/sonarr/api/v3/series", "x-api-key", "k1"))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let denied = app
        .oneshot(with_header("/sonarr/api/v3/series", "x-api-key", "k2"))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    assert!(denied.headers().get(header::WWW_AUTHENTICATE).is_none());
    assert!(denied.headers().contains_key("x-request-id"));
    assert_eq!(denied.headers()["x-content-type-options"], "nosniff");
    assert_eq!(json_body(denied).await, json!({ "error": "Unauthorized" }));
}

#[tokio::test]
async fn test_api_key_query_param() {
    let app = apikey_gateway().await;

    let request = Request::builder()
        .uri("/sonarr/api/v3/series?apikey=k1&term=a%20b&page=2")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // the gateway key never reaches the upstream
    let seen = json_body(response).await;
    assert_eq!(seen["query"], "term=a%20b&page=2");

    let request = Request::builder()
        .uri("/sonarr/api/v3/series?apikey=k2")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_api_key() {
    let app = apikey_gateway().await;

    let request = Request::builder()
        .uri("/sonarr/api/v3/series")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(with_header("/sonarr/api/v3/series", "x-api-key", ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Auth runs before routing, so unknown paths do not leak their status
#[tokio::test]
async fn test_auth_precedes_routing() {
    let app = apikey_gateway().await;

    let request = Request::builder()
        .uri("/lidarr/api")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_basic_auth_success_strips_credentials() {
    let app = basic_gateway().await;

    let response = app
        .oneshot(with_header(
            "/sonarr/api/v3/series",
            "authorization",
            &basic("admin", "hunter2"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen = json_body(response).await;
    assert!(seen["headers"].get("authorization").is_none());
    assert_eq!(seen["headers"]["x-api-key"], common::SONARR_SECRET);
}

#[tokio::test]
async fn test_basic_auth_failure_challenges() {
    let app = basic_gateway().await;

    let response = app
        .clone()
        .oneshot(with_header(
            "/sonarr/api/v3/series",
            "authorization",
            &basic("admin", "wrong"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        r#"Basic realm="Restricted""#
    );

    let request = Request::builder()
        .uri("/sonarr/api/v3/series")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn test_basic_mode_ignores_api_key() {
    let app = basic_gateway().await;

    let response = app
        .oneshot(with_header("/sonarr/api/v3/series", "x-api-key", "k1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
