//! OIDC Auth Service Library
//!
//! Authentication and authorization sidecar for HTTP services behind a proxy.
//!
//! # Features
//!
//! - **OIDC login**: authorization-code flow with CSRF-bound, single-use state
//! - **Sessions**: server-side sessions with optional strict revalidation and refresh
//! - **Authenticator chain**: Kubernetes service-account tokens, session cookies, bearer ID tokens
//! - **Authorizer chain**: static group allowlist or hot-reloaded per-host group rules
//! - **Upstream identity headers**: user id, groups, and re-emitted ID token

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authn;
pub mod authz;
pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod store;
pub mod transformer;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        _ => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
    }

    Ok(())
}
