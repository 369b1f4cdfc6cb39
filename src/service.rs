//! Protected backend services and path-prefix routing

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use url::{Position, Url};

use crate::{
    Error, Result,
    config::{Config, ServiceConfig},
    whitelist::Whitelist,
};

/// The backends the gateway knows how to front
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Sonarr, mounted under `/sonarr`
    Sonarr,
    /// Radarr, mounted under `/radarr`
    Radarr,
}

impl ServiceKind {
    /// All service kinds, in routing order
    pub const ALL: [Self; 2] = [Self::Sonarr, Self::Radarr];

    /// Lowercase service name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sonarr => "sonarr",
            Self::Radarr => "radarr",
        }
    }

    /// Path prefix the service is mounted under
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Sonarr => "/sonarr",
            Self::Radarr => "/radarr",
        }
    }

    /// Strip this service's prefix on a segment boundary.
    ///
    /// `/sonarr/api` yields `/api`, `/sonarr` yields `/`, and
    /// `/sonarrx` does not match.
    #[must_use]
    pub fn strip_prefix(self, path: &str) -> Option<&str> {
        let rest = path.strip_prefix(self.prefix())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// Find the service whose prefix owns `path`
    #[must_use]
    pub fn for_path(path: &str) -> Option<(Self, &str)> {
        Self::ALL
            .into_iter()
            .find_map(|kind| kind.strip_prefix(path).map(|rest| (kind, rest)))
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A configured backend, ready to receive traffic
#[derive(Debug)]
pub struct Service {
    kind: ServiceKind,
    url: Url,
    raw_url: String,
    api_key: String,
    whitelist: Whitelist,
    patterns: Vec<String>,
}

impl Service {
    /// Build a service from its configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is invalid or if whitelist
    /// patterns were supplied but none of them compile.
    pub fn from_config(kind: ServiceKind, config: &ServiceConfig) -> Result<Self> {
        let url = config
            .parsed_url()
            .map_err(|e| Error::Config(format!("{kind}: {e}")))?;
        let whitelist = Whitelist::compile(&config.whitelist)
            .map_err(|e| Error::Config(format!("{kind}: {e}")))?;

        if config.api_key.is_empty() {
            info!(service = %kind, "No upstream api_key configured, forwarding an empty X-Api-Key");
        }

        Ok(Self {
            kind,
            url,
            raw_url: config.url.clone(),
            api_key: config.api_key.clone(),
            whitelist,
            patterns: config.whitelist.clone(),
        })
    }

    /// Which backend this is
    #[must_use]
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// Parsed base URL
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Base URL exactly as configured
    #[must_use]
    pub fn raw_url(&self) -> &str {
        &self.raw_url
    }

    /// `host[:port]` of the upstream, as sent in the `Host` header
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.url[Position::BeforeHost..Position::AfterPort]
    }

    /// Secret injected as `X-Api-Key` on every forwarded request
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Compiled access rules
    #[must_use]
    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Whitelist rules exactly as configured
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// The set of configured services
#[derive(Debug, Default, Clone)]
pub struct Services {
    sonarr: Option<Arc<Service>>,
    radarr: Option<Arc<Service>>,
}

impl Services {
    /// Build every configured service. Unconfigured services stay absent.
    ///
    /// # Errors
    ///
    /// Returns the first service construction error.
    pub fn from_config(config: &Config) -> Result<Self> {
        let build = |kind: ServiceKind, service: &ServiceConfig| -> Result<Option<Arc<Service>>> {
            if service.is_configured() {
                Service::from_config(kind, service).map(|s| Some(Arc::new(s)))
            } else {
                Ok(None)
            }
        };

        Ok(Self {
            sonarr: build(ServiceKind::Sonarr, &config.sonarr)?,
            radarr: build(ServiceKind::Radarr, &config.radarr)?,
        })
    }

    /// Look up a configured service
    #[must_use]
    pub fn get(&self, kind: ServiceKind) -> Option<&Arc<Service>> {
        match kind {
            ServiceKind::Sonarr => self.sonarr.as_ref(),
            ServiceKind::Radarr => self.radarr.as_ref(),
        }
    }

    /// Iterate over configured services in routing order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.sonarr.iter().chain(self.radarr.iter())
    }

    /// Whether no service is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sonarr.is_none() && self.radarr.is_none()
    }
}
