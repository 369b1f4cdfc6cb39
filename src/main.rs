//! arr-gateway - access-controlled reverse proxy for Sonarr and Radarr

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use arr_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Check) => run_check(config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load the config file and environment, then apply CLI overrides
fn load_config(cli: &Cli) -> arr_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    Ok(config)
}

/// Validate everything `serve` would build, without binding
fn run_check(config: Config) -> ExitCode {
    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("✅ Configuration is valid");
    println!("   Listen: {}", gateway.addr());
    println!("   TLS: {}", if gateway.tls_enabled() { "enabled" } else { "disabled" });
    println!("   Auth mode: {}", gateway.auth_mode());
    for service in gateway.services().iter() {
        println!(
            "   {}: {} ({} whitelist rule(s))",
            service.kind(),
            service.raw_url(),
            service.whitelist().len()
        );
    }

    ExitCode::SUCCESS
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting arr-gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!(fatal = e.is_fatal(), "Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
