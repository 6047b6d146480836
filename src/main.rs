//! OIDC Auth Service - authentication and authorization sidecar

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use oidc_authservice::{
    authz::RuleTable,
    cli::{Cli, Command},
    config::Config,
    server::{AuthService, PipelineSettings},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check { ref rules }) => match run_check(&cli, rules.as_deref()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Configuration invalid: {e:#}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

/// Validate configuration and rules without starting the service
fn run_check(cli: &Cli, rules: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    config.validate()?;
    PipelineSettings::from_config(&config)?;

    let rules = rules.or(config.authz.rules_path.as_deref());
    if let Some(path) = rules {
        let table = RuleTable::load(path).with_context(|| format!("invalid rules file {}", path.display()))?;
        println!("Rules file {} OK ({} hosts)", path.display(), table.rules.len());
    }

    println!("Configuration OK");
    Ok(())
}

async fn run_server(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        readiness_port = config.server.readiness_port,
        "Starting OIDC auth service"
    );

    let service = match AuthService::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create auth service: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = service.run().await {
        error!("Auth service error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Auth service shutdown complete");
    ExitCode::SUCCESS
}
