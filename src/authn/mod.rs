//! Authenticator chain.
//!
//! Each [`Authenticator`] looks at a request and either vouches for an
//! identity, declines to rule ([`Authentication::PassThrough`]), or rejects
//! the credential outright with an [`AuthenticatorError`]. The
//! [`AuthenticatorChain`] asks them in configured order and stops at the
//! first one that does not pass.

mod idtoken;
mod kubernetes;
mod session;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use tracing::debug;

use crate::session::ProviderError;
use crate::store::StoreError;

pub use idtoken::IdTokenAuthenticator;
pub use kubernetes::{KubeTokenReviewer, KubernetesAuthenticator, ReviewError, TokenReviewer};
pub use session::{SessionAuthenticator, session_id};

/// `extra` key recording how the identity was established.
pub const AUTH_METHOD_KEY: &str = "auth-method";

/// Identity established for a single request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    /// Subject identifier; empty for client-credential tokens without one
    pub name: String,
    /// Group memberships
    pub groups: Vec<String>,
    /// Additional attributes
    pub extra: BTreeMap<String, Vec<String>>,
}

impl User {
    /// User with a name and groups and no extra attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            name: name.into(),
            groups,
            extra: BTreeMap::new(),
        }
    }

    /// First value of `extra["auth-method"]`, if any.
    #[must_use]
    pub fn auth_method(&self) -> Option<&str> {
        self.extra
            .get(AUTH_METHOD_KEY)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

/// A successful authentication.
#[derive(Debug, Clone, Default)]
pub struct AuthResponse {
    /// Who the request is from
    pub user: User,
    /// Headers to forward upstream on top of the identity headers
    pub headers: HeaderMap,
}

impl AuthResponse {
    /// Response carrying only an identity.
    #[must_use]
    pub fn new(user: User) -> Self {
        Self {
            user,
            headers: HeaderMap::new(),
        }
    }
}

/// Outcome of a single authenticator.
#[derive(Debug, Clone)]
pub enum Authentication {
    /// The credential was recognized and accepted.
    Authenticated(AuthResponse),
    /// No opinion; the next authenticator should try.
    PassThrough,
}

/// Definitive authentication failures. None of these let the chain continue.
#[derive(Debug, thiserror::Error)]
pub enum AuthenticatorError {
    /// The session's credentials can no longer be renewed; the user must log in again.
    #[error("login expired")]
    LoginExpired,

    /// The credential was recognized and refused.
    #[error("credential rejected: {0}")]
    Rejected(String),

    /// The identity provider failed unexpectedly.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The session store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A pluggable credential check.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Name used in configuration and logs.
    fn name(&self) -> &'static str;

    /// Inspect the request.
    async fn authenticate(&self, parts: &Parts) -> Result<Authentication, AuthenticatorError>;
}

/// Authenticators in configured order.
#[derive(Clone, Default)]
pub struct AuthenticatorChain {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl AuthenticatorChain {
    /// Chain consulting `authenticators` front to back.
    #[must_use]
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }

    /// Names of the authenticators, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.authenticators.iter().map(|a| a.name()).collect()
    }

    /// First non-pass-through result, or `Ok(None)` if every authenticator passed.
    pub async fn authenticate(&self, parts: &Parts) -> Result<Option<AuthResponse>, AuthenticatorError> {
        for authenticator in &self.authenticators {
            match authenticator.authenticate(parts).await? {
                Authentication::Authenticated(response) => {
                    debug!(
                        authenticator = authenticator.name(),
                        user = %response.user.name,
                        "Request authenticated"
                    );
                    return Ok(Some(response));
                }
                Authentication::PassThrough => {
                    debug!(authenticator = authenticator.name(), "Authenticator passed");
                }
            }
        }
        Ok(None)
    }
}

/// Strip a case-insensitive `Bearer ` prefix. Values without one are returned as-is.
pub(crate) fn bearer_token(value: &str) -> &str {
    let value = value.trim();
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => value,
    }
}
