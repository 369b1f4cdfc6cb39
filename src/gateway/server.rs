//! Gateway server

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use axum_server::Handle;
use hyper_util::{
    rt::{TokioExecutor, TokioTimer},
    server::conn::auto,
};
use tokio::signal;
use tracing::{info, warn};

use super::{
    auth::AuthStrategy,
    forward::Forwarder,
    guard::RequestGuard,
    router::{AppState, create_router},
};
use crate::{
    Error, Result,
    config::{AuthMode, Config},
    service::Services,
    tls::{ClientAuth, PeerIdentityAcceptor, TlsMinVersion, build_server_config},
};

/// Access-controlled gateway in front of the media services
pub struct Gateway {
    addr: SocketAddr,
    state: Arc<AppState>,
    tls: Option<Arc<rustls::ServerConfig>>,
    tls_min_version: TlsMinVersion,
    read_header_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Gateway {
    /// Validate `config` and build every runtime component.
    ///
    /// Nothing is bound yet; [`run`](Self::run) or [`serve`](Self::serve)
    /// start listening.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` listing every configuration problem, or
    /// `Error::Tls` if the TLS material cannot be loaded.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host '{}': {e}", config.server.host)))?,
            config.server.port,
        );

        let services = Services::from_config(&config)?;
        let auth = Arc::new(AuthStrategy::from_config(&config.auth)?);

        let tls_min_version = TlsMinVersion::parse_or_default(&config.server.tls_min_version);
        let tls = if config.tls.enabled() {
            let client_auth = if auth.requires_client_cert() {
                ClientAuth::Required
            } else {
                ClientAuth::None
            };
            Some(Arc::new(build_server_config(
                &config.tls,
                tls_min_version,
                client_auth,
            )?))
        } else {
            None
        };

        let forwarder = Forwarder::new(&config.upstream, config.server.write_timeout)?;
        let guard = RequestGuard::new(
            services,
            config.server.max_body_size,
            config.server.read_timeout,
        );

        Ok(Self {
            addr,
            state: Arc::new(AppState {
                guard,
                auth,
                forwarder,
            }),
            tls,
            tls_min_version,
            read_header_timeout: config.server.read_header_timeout,
            shutdown_timeout: config.server.shutdown_timeout,
        })
    }

    /// The fully layered router, without a listener
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Configured listen address
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the listener serves HTTPS
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Active authentication mode
    #[must_use]
    pub fn auth_mode(&self) -> AuthMode {
        self.state.auth.mode()
    }

    /// Configured services
    #[must_use]
    pub fn services(&self) -> &Services {
        self.state.guard.services()
    }

    /// Run until SIGINT/SIGTERM, then drain in-flight requests for at most
    /// `shutdown_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run(self) -> Result<()> {
        let handle = Handle::new();
        let shutdown = handle.clone();
        let grace = self.shutdown_timeout;

        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.graceful_shutdown(Some(grace));
        });

        self.serve(handle).await
    }

    /// Serve until `handle` is told to shut down
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn serve(self, handle: Handle<SocketAddr>) -> Result<()> {
        self.log_banner();

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        match self.tls {
            Some(tls) => {
                let mut server = axum_server::bind(self.addr)
                    .acceptor(PeerIdentityAcceptor::new(tls))
                    .handle(handle);
                tune_http1(server.http_builder(), self.read_header_timeout);
                server.serve(app).await?;
            }
            None => {
                let mut server = axum_server::bind(self.addr).handle(handle);
                tune_http1(server.http_builder(), self.read_header_timeout);
                server.serve(app).await?;
            }
        }

        info!("Gateway stopped");
        Ok(())
    }

    fn log_banner(&self) {
        info!("============================================================");
        info!("ARR GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(
            addr = %self.addr,
            tls = self.tls_enabled(),
            tls_min_version = %self.tls_min_version,
            "Listening"
        );
        info!(auth_mode = %self.auth_mode(), "Authentication");
        if self.auth_mode() != AuthMode::Mtls && !self.tls_enabled() {
            warn!("TLS is disabled, credentials travel in plain text");
        }
        for service in self.services().iter() {
            info!(
                service = %service.kind(),
                url = %service.raw_url(),
                rules = service.whitelist().len(),
                "Service configured"
            );
        }
        info!("============================================================");
    }
}

/// HTTP/1.1 connection settings shared by the plain and TLS listeners.
/// A zero `read_header_timeout` leaves header reads unbounded.
fn tune_http1(builder: &mut auto::Builder<TokioExecutor>, read_header_timeout: Duration) {
    let mut http1 = builder.http1();
    http1.timer(TokioTimer::new());
    if !read_header_timeout.is_zero() {
        http1.header_read_timeout(read_header_timeout);
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, ServiceConfig};

    fn config() -> Config {
        Config {
            auth: AuthConfig {
                api_key: "k1".to_string(),
                ..AuthConfig::default()
            },
            radarr: ServiceConfig {
                url: "http://radarr:7878".to_string(),
                api_key: "r".to_string(),
                whitelist: vec!["^/api/v3/movie$".to_string()],
            },
            ..Config::default()
        }
    }

    #[test]
    fn builds_plain_gateway() {
        let gateway = Gateway::new(config()).unwrap();
        assert!(!gateway.tls_enabled());
        assert_eq!(gateway.auth_mode(), AuthMode::ApiKey);
        assert_eq!(gateway.addr().port(), 8443);
        assert_eq!(gateway.services().iter().count(), 1);
    }

    #[test]
    fn invalid_config_is_refused() {
        let err = Gateway::new(Config::default()).err().unwrap();
        assert!(err.to_string().contains("at least one service must be configured"));
    }

    #[test]
    fn invalid_host_is_refused() {
        let mut config = config();
        config.server.host = "not-an-ip".to_string();
        let err = Gateway::new(config).err().unwrap();
        assert!(err.to_string().contains("Invalid host"));
    }

    #[test]
    fn missing_tls_files_are_fatal() {
        let mut config = config();
        config.tls.cert = "/nonexistent/server.crt".to_string();
        config.tls.key = "/nonexistent/server.key".to_string();
        let err = Gateway::new(config).err().unwrap();
        assert!(matches!(err, Error::Tls(_)));
    }
}
