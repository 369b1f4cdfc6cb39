//! Error types for the gateway

use std::io;

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
///
/// These surface at startup or from the outbound client. Per-request
/// rejections that turn into HTTP status codes live in
/// [`crate::gateway::guard::Rejection`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded or assembled
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a configuration error from a list of problems, joined the way
    /// they are reported at startup.
    #[must_use]
    pub fn config_problems(problems: &[String]) -> Self {
        Self::Config(format!(
            "configuration validation failed: {}",
            problems.join("; ")
        ))
    }

    /// Whether this error should abort startup rather than a single request
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Tls(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_problems_are_joined_in_order() {
        let err = Error::config_problems(&[
            "at least one service must be configured".to_string(),
            "auth.api_key required for apikey auth mode".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Configuration error: configuration validation failed: \
             at least one service must be configured; auth.api_key required for apikey auth mode"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Config("x".into()).is_fatal());
        assert!(Error::Tls("x".into()).is_fatal());
        assert!(!Error::Internal("x".into()).is_fatal());
    }
}
