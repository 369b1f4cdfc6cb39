//! Configuration management
//!
//! Configuration is read from an optional YAML file and then overridden by
//! `ARR_GATEWAY_`-prefixed environment variables (`__` separates nesting
//! levels, e.g. `ARR_GATEWAY_SONARR__URL`). The result is validated as a
//! whole so every problem is reported at once before the server starts.

use std::{path::Path, str::FromStr, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::{Error, Result};

/// Default maximum request body size (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Listener TLS material
    pub tls: TlsConfig,
    /// Caller authentication
    pub auth: AuthConfig,
    /// Outbound client tuning
    pub upstream: UpstreamConfig,
    /// Sonarr service (unconfigured when `url` is empty)
    pub sonarr: ServiceConfig,
    /// Radarr service (unconfigured when `url` is empty)
    pub radarr: ServiceConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("ARR_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.normalize();
        Ok(config)
    }

    /// Replace out-of-range values with their defaults, warning for each.
    pub fn normalize(&mut self) {
        if self.server.max_body_size == 0 {
            warn!(
                value = self.server.max_body_size,
                "Invalid max_body_size, using default 10MB"
            );
            self.server.max_body_size = DEFAULT_MAX_BODY_SIZE;
        }
    }

    /// Validate the configuration, collecting every problem found.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` listing all problems when any check fails.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if !self.sonarr.is_configured() && !self.radarr.is_configured() {
            problems.push(
                "at least one service must be configured (set sonarr.url or radarr.url)"
                    .to_string(),
            );
        }

        for (name, service) in [("sonarr", &self.sonarr), ("radarr", &self.radarr)] {
            if service.is_configured() {
                if let Err(e) = service.parsed_url() {
                    problems.push(format!("{name}.url: {e}"));
                }
            }
        }

        match self.auth.mode() {
            Ok(AuthMode::Basic) => {
                if self.auth.basic_user.is_empty() {
                    problems.push("auth.basic_user required for basic auth mode".to_string());
                }
                if self.auth.basic_pass.is_empty() {
                    problems.push("auth.basic_pass required for basic auth mode".to_string());
                }
            }
            Ok(AuthMode::ApiKey) => {
                if self.auth.api_key.is_empty() {
                    problems.push("auth.api_key required for apikey auth mode".to_string());
                }
            }
            Ok(AuthMode::Mtls) => {
                if self.tls.cert.is_empty() {
                    problems.push("tls.cert required for mTLS mode".to_string());
                }
                if self.tls.key.is_empty() {
                    problems.push("tls.key required for mTLS mode".to_string());
                }
                if self.tls.ca_cert.is_empty() {
                    problems.push(
                        "tls.ca_cert required for mTLS mode (CA to verify client certs)"
                            .to_string(),
                    );
                }
            }
            Err(e) => problems.push(e),
        }

        if self.tls.cert.is_empty() != self.tls.key.is_empty() {
            problems.push("tls.cert and tls.key must both be set for HTTPS".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::config_problems(&problems))
        }
    }
}

/// Server (listener) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Time allowed to read a request body (zero: unbounded)
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Time allowed for the upstream exchange up to its response headers
    /// (zero: only `upstream.response_header_timeout` applies). Streamed
    /// response bodies are not bounded.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Time allowed for a connection to deliver the next request's headers
    /// (zero: unbounded)
    #[serde(with = "humantime_serde")]
    pub read_header_timeout: Duration,
    /// Grace period for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: u64,
    /// Minimum TLS protocol version (`1.2` or `1.3`)
    pub tls_min_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            read_header_timeout: Duration::from_secs(20),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            tls_min_version: "1.2".to_string(),
        }
    }
}

/// Listener TLS material (PEM file paths)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Server certificate chain
    pub cert: String,
    /// Server private key
    pub key: String,
    /// CA used to verify client certificates
    pub ca_cert: String,
}

impl TlsConfig {
    /// TLS is served when both certificate and key are configured
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.cert.is_empty() && !self.key.is_empty()
    }
}

/// Authentication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Client certificate verified during the TLS handshake
    Mtls,
    /// HTTP Basic credentials
    Basic,
    /// Shared API key in a header or query parameter
    ApiKey,
}

impl AuthMode {
    /// Configuration name of the mode
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mtls => "mtls",
            Self::Basic => "basic",
            Self::ApiKey => "apikey",
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mtls" => Ok(Self::Mtls),
            "basic" => Ok(Self::Basic),
            "apikey" => Ok(Self::ApiKey),
            other => Err(format!(
                "invalid auth.mode '{other}' (valid modes: apikey, mtls, basic)"
            )),
        }
    }
}

/// Authentication configuration for gateway access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Selected mode: `apikey` (default), `basic` or `mtls`
    pub mode: String,
    /// Shared key for `apikey` mode
    pub api_key: String,
    /// Username for `basic` mode
    pub basic_user: String,
    /// Password for `basic` mode
    pub basic_pass: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::ApiKey.as_str().to_string(),
            api_key: String::new(),
            basic_user: String::new(),
            basic_pass: String::new(),
        }
    }
}

impl AuthConfig {
    /// Parse the configured mode; an empty value selects `apikey`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem for an unknown mode.
    pub fn mode(&self) -> std::result::Result<AuthMode, String> {
        if self.mode.is_empty() {
            return Ok(AuthMode::ApiKey);
        }
        self.mode.parse()
    }
}

/// Outbound HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// TCP connect plus TLS handshake deadline
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Deadline for the upstream's response headers
    #[serde(with = "humantime_serde")]
    pub response_header_timeout: Duration,
    /// How long an idle pooled connection is kept
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
    /// Idle connections kept per upstream host
    pub pool_max_idle_per_host: usize,
    /// TCP keepalive interval
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            response_header_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 10,
            tcp_keepalive: Duration::from_secs(30),
        }
    }
}

/// One protected backend as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL; an empty value leaves the service unconfigured
    pub url: String,
    /// Secret forwarded to the service as `X-Api-Key`
    pub api_key: String,
    /// Ordered whitelist rules
    pub whitelist: Vec<String>,
}

impl ServiceConfig {
    /// Whether this service has been configured
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }

    /// Parse and check the base URL (http/https with a host)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is unparseable, has another
    /// scheme, or has no host.
    pub fn parsed_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid URL '{}': {e}", self.url)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::Config(format!(
                "invalid URL scheme '{}' (must be http or https)",
                url.scheme()
            )));
        }

        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::Config(format!("URL '{}' is missing a host", self.url)));
        }

        Ok(url)
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
