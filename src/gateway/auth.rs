//! Caller authentication
//!
//! Exactly one mode is active per process. `mtls` is enforced by the TLS
//! handshake, so the middleware lets every request through in that mode.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, header, uri::PathAndQuery},
    middleware::Next,
    response::Response,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use percent_encoding::percent_decode_str;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::error_response;
use crate::{
    Error, Result,
    config::{AuthConfig, AuthMode},
};

/// Header carrying the gateway API key
pub const API_KEY_HEADER: &str = "x-api-key";
/// Query parameter accepted as an API key fallback
pub const API_KEY_QUERY_PARAM: &str = "apikey";

const BASIC_CHALLENGE: &str = r#"Basic realm="Restricted""#;

/// Resolved authentication strategy
pub enum AuthStrategy {
    /// Client certificates were verified during the handshake
    MutualTls,
    /// HTTP Basic credentials
    Basic {
        /// Expected username
        username: String,
        /// Expected password
        password: String,
    },
    /// Shared API key
    ApiKey {
        /// Expected key
        key: String,
    },
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStrategy")
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

/// Where the caller put its API key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// `X-Api-Key` header
    Header,
    /// `apikey` query parameter
    QueryParam,
}

/// Why authentication failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No API key in the header or query
    MissingKey,
    /// API key present but wrong
    InvalidKey(KeySource),
    /// No usable Basic credentials
    MissingCredentials,
    /// Basic credentials present but wrong
    InvalidCredentials,
}

impl AuthFailure {
    /// Reason recorded in the audit log
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::MissingKey => "no key provided",
            Self::InvalidKey(_) => "invalid key",
            Self::MissingCredentials => "no credentials provided",
            Self::InvalidCredentials => "invalid credentials",
        }
    }
}

impl AuthStrategy {
    /// Resolve the configured mode and its secrets
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unknown mode.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mode = config.mode().map_err(Error::Config)?;
        Ok(match mode {
            AuthMode::Mtls => Self::MutualTls,
            AuthMode::Basic => Self::Basic {
                username: config.basic_user.clone(),
                password: config.basic_pass.clone(),
            },
            AuthMode::ApiKey => Self::ApiKey {
                key: config.api_key.clone(),
            },
        })
    }

    /// The mode this strategy implements
    #[must_use]
    pub fn mode(&self) -> AuthMode {
        match self {
            Self::MutualTls => AuthMode::Mtls,
            Self::Basic { .. } => AuthMode::Basic,
            Self::ApiKey { .. } => AuthMode::ApiKey,
        }
    }

    /// Whether the listener must demand client certificates
    #[must_use]
    pub fn requires_client_cert(&self) -> bool {
        matches!(self, Self::MutualTls)
    }

    /// Check the caller's credentials
    ///
    /// # Errors
    ///
    /// Returns the [`AuthFailure`] describing why the caller was refused.
    pub fn verify(&self, headers: &HeaderMap, uri: &Uri) -> std::result::Result<(), AuthFailure> {
        match self {
            Self::MutualTls => Ok(()),
            Self::Basic { username, password } => {
                let (user, pass) =
                    basic_credentials(headers).ok_or(AuthFailure::MissingCredentials)?;
                let user_ok = constant_time_eq(&user, username);
                let pass_ok = constant_time_eq(&pass, password);
                if user_ok && pass_ok {
                    Ok(())
                } else {
                    Err(AuthFailure::InvalidCredentials)
                }
            }
            Self::ApiKey { key } => {
                let (presented, source) =
                    presented_api_key(headers, uri).ok_or(AuthFailure::MissingKey)?;
                if constant_time_eq(&presented, key) {
                    Ok(())
                } else {
                    Err(AuthFailure::InvalidKey(source))
                }
            }
        }
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(auth): State<Arc<AuthStrategy>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let path = request.uri().path().to_owned();

    if matches!(*auth, AuthStrategy::ApiKey { .. })
        && matches!(
            presented_api_key(request.headers(), request.uri()),
            Some((_, KeySource::QueryParam))
        )
    {
        warn!(
            path = %path,
            remote_addr = %remote_addr,
            "API key provided via query parameter (less secure)"
        );
    }

    match auth.verify(request.headers(), request.uri()) {
        Ok(()) => {
            debug!(path = %path, auth_mode = %auth.mode(), "Authenticated request");
            match *auth {
                AuthStrategy::Basic { .. } => {
                    request.headers_mut().remove(header::AUTHORIZATION);
                }
                AuthStrategy::ApiKey { .. } => strip_query_api_key(request.uri_mut()),
                AuthStrategy::MutualTls => {}
            }
            next.run(request).await
        }
        Err(failure) => {
            warn!(
                auth_mode = %auth.mode(),
                method = %request.method(),
                reason = failure.reason(),
                path = %path,
                remote_addr = %remote_addr,
                via_query_param = matches!(failure, AuthFailure::InvalidKey(KeySource::QueryParam)),
                "Authentication failed"
            );
            unauthorized_response(&auth)
        }
    }
}

/// Create a 401 Unauthorized response
fn unauthorized_response(auth: &AuthStrategy) -> Response {
    let mut response = error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    if let AuthStrategy::Basic { .. } = auth {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(BASIC_CHALLENGE),
        );
    }
    response
}

/// API key from the `X-Api-Key` header, falling back to the `apikey`
/// query parameter. Empty values count as absent.
fn presented_api_key(headers: &HeaderMap, uri: &Uri) -> Option<(String, KeySource)> {
    let from_header = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    if let Some(key) = from_header {
        return Some((key.to_owned(), KeySource::Header));
    }

    url::form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(name, _)| name == API_KEY_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|v| !v.is_empty())
        .map(|key| (key, KeySource::QueryParam))
}

/// Remove every `apikey` pair from the query, leaving the other pairs
/// byte-for-byte intact.
fn strip_query_api_key(uri: &mut Uri) {
    let Some(query) = uri.query() else {
        return;
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(name, _)| name);
            percent_decode_str(name).decode_utf8_lossy() != API_KEY_QUERY_PARAM
        })
        .collect();
    if kept.len() == query.split('&').count() {
        return;
    }

    let path_and_query = if kept.is_empty() {
        uri.path().to_owned()
    } else {
        format!("{}?{}", uri.path(), kept.join("&"))
    };
    let mut parts = uri.clone().into_parts();
    let Ok(path_and_query) = PathAndQuery::try_from(path_and_query) else {
        return;
    };
    parts.path_and_query = Some(path_and_query);
    if let Ok(stripped) = Uri::from_parts(parts) {
        *uri = stripped;
    }
}

/// Username and password from an `Authorization: Basic` header
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

fn constant_time_eq(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_key(key: &str) -> AuthStrategy {
        AuthStrategy::ApiKey {
            key: key.to_string(),
        }
    }

    fn basic() -> AuthStrategy {
        AuthStrategy::Basic {
            username: "admin".to_string(),
            password: "s3cret:with:colons".to_string(),
        }
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn basic_header(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
    }

    #[test]
    fn consumed_api_key_is_removed_from_query() {
        let strip = |uri: &str| {
            let mut uri: Uri = uri.parse().unwrap();
            strip_query_api_key(&mut uri);
            uri.to_string()
        };
        assert_eq!(
            strip("/sonarr/api/v3/series?apikey=k1&term=a%20b&page=2"),
            "/sonarr/api/v3/series?term=a%20b&page=2"
        );
        assert_eq!(strip("/sonarr/api?api%6Bey=k1"), "/sonarr/api");
        assert_eq!(strip("/sonarr/api?apikey=k1&apikey=k2"), "/sonarr/api");
        assert_eq!(strip("/sonarr/api?apikeys=1"), "/sonarr/api?apikeys=1");
        assert_eq!(strip("/sonarr/api"), "/sonarr/api");
    }

    #[test]
    fn api_key_from_header() {
        let uri = Uri::from_static("/sonarr/api");
        assert_eq!(api_key("k1").verify(&headers(&[("x-api-key", "k1")]), &uri), Ok(()));
        assert_eq!(
            api_key("k1").verify(&headers(&[("x-api-key", "k2")]), &uri),
            Err(AuthFailure::InvalidKey(KeySource::Header))
        );
    }

    #[test]
    fn api_key_from_query_param() {
        let uri = Uri::from_static("/sonarr/api?page=1&apikey=k1");
        assert_eq!(api_key("k1").verify(&HeaderMap::new(), &uri), Ok(()));

        let uri = Uri::from_static("/sonarr/api?apikey=nope");
        assert_eq!(
            api_key("k1").verify(&HeaderMap::new(), &uri),
            Err(AuthFailure::InvalidKey(KeySource::QueryParam))
        );
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let uri = Uri::from_static("/sonarr/api?apikey=k1");
        assert_eq!(
            api_key("k1").verify(&headers(&[("x-api-key", "wrong")]), &uri),
            Err(AuthFailure::InvalidKey(KeySource::Header))
        );
    }

    #[test]
    fn empty_key_is_always_rejected() {
        let uri = Uri::from_static("/sonarr/api?apikey=");
        assert_eq!(
            api_key("").verify(&headers(&[("x-api-key", "")]), &uri),
            Err(AuthFailure::MissingKey)
        );
        assert_eq!(
            api_key("").verify(&HeaderMap::new(), &Uri::from_static("/")),
            Err(AuthFailure::MissingKey)
        );
    }

    #[test]
    fn basic_credentials_accepted() {
        let uri = Uri::from_static("/");
        let value = basic_header("admin", "s3cret:with:colons");
        assert_eq!(basic().verify(&headers(&[("authorization", value.as_str())]), &uri), Ok(()));
    }

    #[test]
    fn basic_scheme_is_case_insensitive() {
        let uri = Uri::from_static("/");
        let value = basic_header("admin", "s3cret:with:colons").replacen("Basic", "bAsIc", 1);
        assert_eq!(basic().verify(&headers(&[("authorization", value.as_str())]), &uri), Ok(()));
    }

    #[test]
    fn basic_credentials_rejected() {
        let uri = Uri::from_static("/");
        let wrong = basic_header("admin", "guess");
        assert_eq!(
            basic().verify(&headers(&[("authorization", wrong.as_str())]), &uri),
            Err(AuthFailure::InvalidCredentials)
        );
        assert_eq!(
            basic().verify(&headers(&[("authorization", "Bearer abc")]), &uri),
            Err(AuthFailure::MissingCredentials)
        );
        assert_eq!(
            basic().verify(&headers(&[("authorization", "Basic !!!")]), &uri),
            Err(AuthFailure::MissingCredentials)
        );
        assert_eq!(
            basic().verify(&HeaderMap::new(), &uri),
            Err(AuthFailure::MissingCredentials)
        );
    }

    #[test]
    fn mtls_passes_everything_through() {
        assert_eq!(
            AuthStrategy::MutualTls.verify(&HeaderMap::new(), &Uri::from_static("/")),
            Ok(())
        );
        assert!(AuthStrategy::MutualTls.requires_client_cert());
        assert!(!api_key("k").requires_client_cert());
    }

    #[test]
    fn from_config_resolves_mode() {
        let config = AuthConfig {
            mode: "basic".to_string(),
            basic_user: "u".to_string(),
            basic_pass: "p".to_string(),
            ..AuthConfig::default()
        };
        assert_eq!(AuthStrategy::from_config(&config).unwrap().mode(), AuthMode::Basic);
        assert_eq!(
            AuthStrategy::from_config(&AuthConfig::default()).unwrap().mode(),
            AuthMode::ApiKey
        );

        let bad = AuthConfig {
            mode: "token".to_string(),
            ..AuthConfig::default()
        };
        assert!(AuthStrategy::from_config(&bad).is_err());
    }

    #[test]
    fn debug_does_not_leak_secrets() {
        let rendered = format!("{:?}", api_key("super-secret"));
        assert!(!rendered.contains("super-secret"));
    }
}
