//! arr-gateway library
//!
//! Access-controlled reverse proxy placed in front of Sonarr and Radarr.
//!
//! # Features
//!
//! - **Path routing**: `/sonarr/...` and `/radarr/...` map to their upstreams
//! - **Whitelisting**: ordered, method-aware regex rules per service; first match decides
//! - **Authentication**: API key, HTTP Basic, or mutual TLS
//! - **Payload hygiene**: body size limits and JSON validation before forwarding
//! - **Secret injection**: each service's API key is added upstream, never exposed to callers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod service;
pub mod tls;
pub mod whitelist;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` of `json` selects
/// JSON output; anything else gives human-readable text.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
