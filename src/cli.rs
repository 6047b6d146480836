//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OIDC authentication and authorization sidecar
#[derive(Parser, Debug)]
#[command(name = "oidc-authservice")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTHSERVICE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "AUTHSERVICE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "AUTHSERVICE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AUTHSERVICE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTHSERVICE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the auth service (default)
    Serve,

    /// Validate the configuration without starting
    Check {
        /// Also parse this authorization rules file
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}
