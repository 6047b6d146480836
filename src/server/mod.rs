//! Auth service server
//!
//! Startup order matters: the readiness probe listens first and reports 503
//! while provider discovery retries. Only once discovery, the stores, and the
//! authenticator and authorizer chains are built does the main listener bind
//! and the readiness flag flip.

mod readiness;
mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::authn::{
    Authenticator, AuthenticatorChain, IdTokenAuthenticator, KubeTokenReviewer, KubernetesAuthenticator,
    SessionAuthenticator,
};
use crate::authz::{Authorizer, AuthorizerChain, ConfigAuthorizer, GroupsAuthorizer, RulesWatcher};
use crate::config::{AuthenticatorKind, AuthzConfig, Config};
use crate::session::provider::{DISCOVERY_RETRY_DELAY, build_http_client};
use crate::session::state::STATE_TTL;
use crate::session::{
    CookiePolicy, OidcSessionManager, ProviderMetadata, SessionManager, StateCodec, UrlStrategy, UserSession,
};
use crate::store::{InMemoryBackend, OIDC_STATE_BUCKET, SessionStore, StoreBackend, USER_SESSION_BUCKET, spawn_reaper};
use crate::{Error, Result};

pub use readiness::{Readiness, readiness_router};
pub use router::{AppState, CALLBACK_PATH, LOGOUT_PATH, PipelineSettings, create_router, parse_header_name};

/// The authentication service
pub struct AuthService {
    config: Config,
}

impl AuthService {
    /// Create a service; the configuration is validated up front.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut startup_rx = shutdown_tx.subscribe();
        let mut serve_rx = shutdown_tx.subscribe();
        tokio::spawn(shutdown_signal(shutdown_tx.clone()));

        info!(config = ?self.config, "Starting auth service");

        let readiness = Readiness::new();
        self.spawn_readiness_probe(readiness.clone(), shutdown_tx.subscribe())
            .await?;

        let (state, _rules_watcher) = tokio::select! {
            built = self.build_state(readiness.clone(), &shutdown_tx) => built?,
            _ = startup_rx.recv() => {
                info!("Shutdown requested before startup completed");
                return Ok(());
            }
        };

        let addr = socket_addr(&self.config.server.host, self.config.server.port)?;
        let listener = TcpListener::bind(addr).await?;
        info!(address = %addr, prefix = %state.settings.prefix, "Auth service listening");

        let app = create_router(state);
        readiness.set_ready();
        info!("Auth service ready");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = serve_rx.recv().await;
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Auth service stopped");
        Ok(())
    }

    async fn spawn_readiness_probe(&self, readiness: Readiness, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let addr = socket_addr(&self.config.server.host, self.config.server.readiness_port)?;
        let listener = TcpListener::bind(addr).await?;
        info!(address = %addr, "Readiness probe listening");

        tokio::spawn(async move {
            let served = axum::serve(listener, readiness_router(readiness))
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "Readiness probe server failed");
            }
        });
        Ok(())
    }

    /// Discover the provider and assemble the pipeline.
    async fn build_state(
        &self,
        readiness: Readiness,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Result<(Arc<AppState>, Option<RulesWatcher>)> {
        let config = &self.config;

        let http = build_http_client(config.oidc.ca_bundle.as_deref())?;
        let metadata =
            ProviderMetadata::discover_with_retry(&http, &config.oidc.provider_url, DISCOVERY_RETRY_DELAY).await;
        let manager: Arc<dyn SessionManager> = Arc::new(OidcSessionManager::new(http, metadata, &config.oidc)?);

        let backend: Arc<dyn StoreBackend> = match &config.session.store_path {
            Some(path) => Arc::new(InMemoryBackend::with_persistence(path)?),
            None => Arc::new(InMemoryBackend::new()),
        };
        spawn_reaper(
            Arc::clone(&backend),
            config.session.reap_interval,
            shutdown_tx.subscribe(),
        );
        let sessions = SessionStore::new(Arc::clone(&backend), USER_SESSION_BUCKET, config.session.max_age);

        let cookies = CookiePolicy {
            same_site: config.session.same_site.into(),
            domain: config.session.domain.clone(),
        };
        let strategy = match &config.session.domain {
            Some(domain) => UrlStrategy::SchemeAndHost {
                session_domain: domain.clone(),
                default_scheme: config.state.scheme_default.clone(),
                scheme_header: config
                    .state
                    .scheme_header
                    .as_deref()
                    .map(parse_header_name)
                    .transpose()?,
            },
            None => UrlStrategy::Relative,
        };
        let states = StateCodec::new(
            SessionStore::new(backend, OIDC_STATE_BUCKET, STATE_TTL),
            cookies.clone(),
            strategy,
            config.state.dynamic_cookie_naming,
        );

        let authenticators = build_authenticators(config, &manager, &sessions).await?;
        info!(authenticators = ?authenticators.names(), "Authenticators configured");
        let (authorizers, rules_watcher) = build_authorizers(&config.authz, shutdown_tx)?;

        let state = Arc::new(AppState {
            readiness,
            authenticators,
            authorizers,
            manager,
            sessions,
            states,
            cookies,
            settings: PipelineSettings::from_config(config)?,
        });
        Ok((state, rules_watcher))
    }
}

/// Authenticators in configured order.
async fn build_authenticators(
    config: &Config,
    manager: &Arc<dyn SessionManager>,
    sessions: &SessionStore<UserSession>,
) -> Result<AuthenticatorChain> {
    let mut authenticators: Vec<Arc<dyn Authenticator>> = Vec::with_capacity(config.authenticators.len());

    for kind in &config.authenticators {
        let authenticator: Arc<dyn Authenticator> = match kind {
            AuthenticatorKind::Kubernetes => {
                let reviewer = KubeTokenReviewer::try_default()
                    .await
                    .map_err(|e| Error::Config(format!("Kubernetes client unavailable: {e}")))?;
                Arc::new(KubernetesAuthenticator::new(
                    Arc::new(reviewer),
                    config.kubernetes.audiences.clone(),
                ))
            }
            AuthenticatorKind::Session => Arc::new(SessionAuthenticator::new(
                sessions.clone(),
                Arc::clone(manager),
                config.session.cookie_name.clone(),
                parse_header_name(&config.session.auth_header)?,
                config.session.strict_validation,
            )),
            AuthenticatorKind::IdToken => Arc::new(IdTokenAuthenticator::new(
                Arc::clone(manager),
                parse_header_name(&config.headers.id_token_header)?,
                config.oidc.user_id_claim.clone(),
                config.oidc.groups_claim.clone(),
                parse_header_name(&config.headers.token_header)?,
                config.headers.token_scheme.clone(),
            )),
        };
        authenticators.push(authenticator);
    }

    Ok(AuthenticatorChain::new(authenticators))
}

/// The rules file authorizer when configured, otherwise the groups allowlist.
fn build_authorizers(
    config: &AuthzConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(AuthorizerChain, Option<RulesWatcher>)> {
    let Some(path) = &config.rules_path else {
        info!(allowlist = ?config.groups_allowlist, "Using groups allowlist authorizer");
        let groups: Arc<dyn Authorizer> = Arc::new(GroupsAuthorizer::new(config.groups_allowlist.iter().cloned()));
        return Ok((AuthorizerChain::new(vec![groups]), None));
    };

    let rules = Arc::new(ConfigAuthorizer::load(path)?);
    let watcher = match RulesWatcher::start(Arc::clone(&rules), shutdown_tx.subscribe()) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "Failed to watch authorization rules, hot-reload disabled");
            None
        }
    };
    let rules: Arc<dyn Authorizer> = rules;
    Ok((AuthorizerChain::new(vec![rules]), watcher))
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    Ok(SocketAddr::new(
        host.parse()
            .map_err(|e| Error::Config(format!("Invalid host '{host}': {e}")))?,
        port,
    ))
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
