//! Request guard
//!
//! Decides whether a request may be forwarded. Checks run in a fixed order
//! and stop at the first failure:
//!
//! 1. path normalization: `.` and `..` segments, encoded or not, are refused (400)
//! 2. route resolution by service prefix (404)
//! 3. service availability (503)
//! 4. whitelist (403)
//! 5. declared `Content-Length` against the size limit (413)
//! 6. bounded body read for POST/PUT/PATCH (400 on read failure, 413 if too big)
//! 7. JSON well-formedness for JSON media types (400)

use std::{sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Method, Request, StatusCode, Uri, header, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::StreamExt;
use percent_encoding::percent_decode_str;

use super::error_response;
use crate::service::{Service, ServiceKind, Services};

/// Why a request was refused before reaching an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Path contains a `.` or `..` segment
    DotSegment,
    /// Path does not start with a known service prefix
    UnknownRoute,
    /// Known prefix, but the service has no configuration
    ServiceNotConfigured(ServiceKind),
    /// No whitelist rule admits this method and path
    NotWhitelisted,
    /// Body larger than the configured maximum
    PayloadTooLarge,
    /// Body could not be read in time or at all
    UnreadableBody,
    /// JSON content type with a malformed body
    InvalidJson,
}

impl Rejection {
    /// HTTP status sent to the caller
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::UnknownRoute => StatusCode::NOT_FOUND,
            Self::DotSegment => StatusCode::BAD_REQUEST,
            Self::ServiceNotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotWhitelisted => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnreadableBody | Self::InvalidJson => StatusCode::BAD_REQUEST,
        }
    }

    /// Reason recorded in the audit log
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::DotSegment => "dot segment in path",
            Self::UnknownRoute => "unknown service prefix",
            Self::ServiceNotConfigured(_) => "service not configured",
            Self::NotWhitelisted => "method/endpoint not whitelisted",
            Self::PayloadTooLarge => "payload too large",
            Self::UnreadableBody => "failed to read payload",
            Self::InvalidJson => "invalid JSON payload",
        }
    }

    fn message(self) -> &'static str {
        match self {
            Self::UnknownRoute => "Not Found",
            Self::ServiceNotConfigured(_) => "Service Not Configured",
            Self::NotWhitelisted => "Forbidden",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::DotSegment | Self::UnreadableBody | Self::InvalidJson => "Bad Request",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        error_response(self.status(), self.message())
    }
}

/// A request path in both wire and decoded form.
///
/// Routing and whitelist matching use [`decoded`](Self::decoded);
/// forwarding uses [`raw`](Self::raw) so percent-encoding survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    raw: String,
    decoded: String,
}

impl RequestPath {
    /// Build from a percent-encoded path
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_owned(),
            decoded: percent_decode_str(raw).decode_utf8_lossy().into_owned(),
        }
    }

    /// Build from a request URI
    #[must_use]
    pub fn from_uri(uri: &Uri) -> Self {
        Self::new(uri.path())
    }

    /// Path as received on the wire
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Percent-decoded path
    #[must_use]
    pub fn decoded(&self) -> &str {
        &self.decoded
    }

    /// Whether any segment of either form is `.` or `..`.
    ///
    /// The decoded form catches `%2e`/`%2E`. Backslashes count as
    /// separators because URL parsers treat them as `/` for http(s).
    #[must_use]
    pub fn has_dot_segment(&self) -> bool {
        [self.raw.as_str(), self.decoded.as_str()].into_iter().any(|path| {
            path.split(['/', '\\'])
                .any(|segment| segment == "." || segment == "..")
        })
    }

    /// Resolve the owning service and strip its prefix from both forms.
    ///
    /// If the prefix only appears after decoding, the raw remainder falls
    /// back to the decoded one.
    #[must_use]
    pub fn route(&self) -> Option<(ServiceKind, Self)> {
        let (kind, decoded) = ServiceKind::for_path(&self.decoded)?;
        let raw = kind.strip_prefix(&self.raw).unwrap_or(decoded);
        Some((
            kind,
            Self {
                raw: raw.to_owned(),
                decoded: decoded.to_owned(),
            },
        ))
    }
}

/// Outbound body of an admitted request
#[derive(Debug)]
pub enum OutboundBody {
    /// Fully read and validated (POST, PUT, PATCH)
    Buffered(Bytes),
    /// Passed through unread
    Streaming(Body),
}

/// A request that passed every guard check
#[derive(Debug)]
pub struct Admitted {
    /// Target service
    pub service: Arc<Service>,
    /// Request head as received
    pub parts: Parts,
    /// Path with the service prefix removed
    pub path: RequestPath,
    /// Body to send upstream
    pub body: OutboundBody,
}

/// Admission checks for proxied requests
#[derive(Debug, Clone)]
pub struct RequestGuard {
    services: Services,
    max_body_size: u64,
    read_timeout: Duration,
}

impl RequestGuard {
    /// Create a guard over the configured services
    #[must_use]
    pub fn new(services: Services, max_body_size: u64, read_timeout: Duration) -> Self {
        Self {
            services,
            max_body_size,
            read_timeout,
        }
    }

    /// Configured services
    #[must_use]
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Run every check against `request`
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`] encountered.
    pub async fn admit(&self, request: Request<Body>) -> Result<Admitted, Rejection> {
        let (parts, body) = request.into_parts();

        let path = RequestPath::from_uri(&parts.uri);
        if path.has_dot_segment() {
            return Err(Rejection::DotSegment);
        }

        let (kind, path) = path
            .route()
            .ok_or(Rejection::UnknownRoute)?;

        let service = self
            .services
            .get(kind)
            .cloned()
            .ok_or(Rejection::ServiceNotConfigured(kind))?;

        if !service
            .whitelist()
            .is_whitelisted(&parts.method, path.decoded())
        {
            return Err(Rejection::NotWhitelisted);
        }

        if declared_length(&parts.headers).is_some_and(|len| len > self.max_body_size) {
            return Err(Rejection::PayloadTooLarge);
        }

        let body = if carries_validated_body(&parts.method) {
            let bytes = self.read_body(body).await?;
            if is_json_media_type(&parts.headers) && !bytes.is_empty() {
                serde_json::from_slice::<serde_json::Value>(&bytes)
                    .map_err(|_| Rejection::InvalidJson)?;
            }
            OutboundBody::Buffered(bytes)
        } else {
            OutboundBody::Streaming(body)
        };

        Ok(Admitted {
            service,
            parts,
            path,
            body,
        })
    }

    async fn read_body(&self, body: Body) -> Result<Bytes, Rejection> {
        let limit = usize::try_from(self.max_body_size).unwrap_or(usize::MAX);

        let read = async {
            let mut stream = body.into_data_stream();
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|_| Rejection::UnreadableBody)?;
                buf.extend_from_slice(&chunk);
                if buf.len() > limit {
                    return Err(Rejection::PayloadTooLarge);
                }
            }
            Ok(buf.freeze())
        };

        // zero disables the deadline
        if self.read_timeout.is_zero() {
            return read.await;
        }
        tokio::time::timeout(self.read_timeout, read)
            .await
            .map_err(|_| Rejection::UnreadableBody)?
    }
}

fn carries_validated_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `application/json` or any `+json` suffix, parameters ignored
fn is_json_media_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            let essence = ct
                .split_once(';')
                .map_or(ct, |(essence, _)| essence)
                .trim()
                .to_ascii_lowercase();
            essence == "application/json" || essence.ends_with("+json")
        })
}
