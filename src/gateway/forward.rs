//! Forwarding admitted requests to their upstream service
//!
//! The outbound request mirrors the inbound one except for:
//!
//! - scheme, host and base path taken from the service URL
//! - query: service query, `&`, caller query (separator only when both are non-empty)
//! - `X-Api-Key` replaced by the service secret
//! - `Host` set to the upstream authority
//! - an empty `User-Agent` when the caller sent none
//! - hop-by-hop headers removed and `X-Forwarded-For` extended
//!
//! The upstream response is relayed as-is, minus hop-by-hop headers.

use std::{net::IpAddr, time::Duration};

use axum::{
    body::{Body, HttpBody},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use percent_encoding::percent_decode_str;
use tracing::{debug, error, warn};
use url::Url;

use super::{
    error_response,
    guard::{Admitted, OutboundBody},
};
use crate::{Result, config::UpstreamConfig, service::Service};

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Outbound HTTP client shared by all requests
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    /// Bound on connect, upload and the wait for response headers
    deadline: Option<Duration>,
}

impl Forwarder {
    /// Build the pooled client
    ///
    /// Redirects are not followed and responses are not decompressed.
    /// The upstream exchange is bounded by the shorter of
    /// `response_header_timeout` and `write_timeout`; zero disables either.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &UpstreamConfig, write_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .tcp_keepalive(config.tcp_keepalive)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            deadline: shortest_limit(config.response_header_timeout, write_timeout),
        })
    }

    /// Effective deadline for one upstream exchange, `None` when unbounded
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Send `admitted` upstream and relay the response.
    ///
    /// Connection failures and header timeouts become 502.
    pub async fn forward(&self, admitted: Admitted, remote_ip: Option<IpAddr>) -> Response {
        let Admitted {
            service,
            parts,
            path,
            body,
        } = admitted;

        let url = upstream_url(service.url(), path.raw(), parts.uri.query());
        if !forwards_path_as_checked(&url, service.url(), path.raw()) {
            warn!(
                path = %path.raw(),
                upstream_path = %url.path(),
                "Upstream URL does not preserve the checked path"
            );
            return error_response(StatusCode::BAD_REQUEST, "Bad Request");
        }

        let buffered = matches!(body, OutboundBody::Buffered(_));
        let headers = outbound_headers(&parts.headers, &service, remote_ip, buffered);

        let mut builder = self
            .client
            .request(parts.method.clone(), url.clone())
            .headers(headers);
        builder = match body {
            OutboundBody::Buffered(bytes) => builder.body(bytes),
            OutboundBody::Streaming(body) if body.is_end_stream() => builder,
            OutboundBody::Streaming(body) => {
                builder.body(reqwest::Body::wrap_stream(body.into_data_stream()))
            }
        };

        debug!(method = %parts.method, upstream = %url, "Forwarding request");

        let result = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, builder.send()).await,
            None => Ok(builder.send().await),
        };
        let upstream = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return bad_gateway(&service, path.raw(), &e.to_string()),
            Err(_) => {
                return bad_gateway(&service, path.raw(), "timed out waiting for response headers");
            }
        };

        relay(upstream)
    }
}

/// Build the upstream URL from the service base, the raw remaining path
/// and the caller's query.
#[must_use]
pub fn upstream_url(base: &Url, raw_path: &str, caller_query: Option<&str>) -> Url {
    let mut url = base.clone();
    url.set_path(&single_joining_slash(base.path(), raw_path));
    url.set_query(merge_query(base.query(), caller_query).as_deref());
    url.set_fragment(None);
    url
}

/// Whether `url` targets exactly the service base joined with `raw_path`.
///
/// URL parsing resolves dot segments and rewrites backslashes, so a path
/// that changed on the way into `url` is not the one the whitelist saw.
/// Percent-encoding differences are ignored.
#[must_use]
pub fn forwards_path_as_checked(url: &Url, base: &Url, raw_path: &str) -> bool {
    let expected = single_joining_slash(base.path(), raw_path);
    percent_decode_str(url.path()).collect::<Vec<u8>>()
        == percent_decode_str(&expected).collect::<Vec<u8>>()
}

fn shortest_limit(a: Duration, b: Duration) -> Option<Duration> {
    [a, b].into_iter().filter(|d| !d.is_zero()).min()
}

/// Join two path pieces with exactly one `/` between them
#[must_use]
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Service query first, then the caller's. `None` when both are empty.
#[must_use]
pub fn merge_query(upstream: Option<&str>, caller: Option<&str>) -> Option<String> {
    let upstream = upstream.unwrap_or_default();
    let caller = caller.unwrap_or_default();
    match (upstream.is_empty(), caller.is_empty()) {
        (true, true) => None,
        (false, false) => Some(format!("{upstream}&{caller}")),
        _ => Some(format!("{upstream}{caller}")),
    }
}

fn outbound_headers(
    incoming: &HeaderMap,
    service: &Service,
    remote_ip: Option<IpAddr>,
    buffered: bool,
) -> HeaderMap {
    let mut headers = incoming.clone();
    strip_hop_by_hop(&mut headers);

    if buffered {
        // recomputed from the buffered bytes
        headers.remove(header::CONTENT_LENGTH);
    }

    if let Ok(host) = HeaderValue::from_str(service.authority()) {
        headers.insert(header::HOST, host);
    }

    match HeaderValue::from_str(service.api_key()) {
        Ok(key) => {
            headers.insert(X_API_KEY, key);
        }
        Err(_) => {
            headers.remove(X_API_KEY);
        }
    }

    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
    }

    if let Some(ip) = remote_ip {
        let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    headers
}

fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn bad_gateway(service: &Service, path: &str, reason: &str) -> Response {
    error!(
        error = %reason,
        path = %path,
        upstream = %service.authority(),
        "Proxy error"
    );
    error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
