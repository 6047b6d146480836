//! Authorizer chain.
//!
//! Every [`Authorizer`] in the chain must allow a request. The first denial
//! wins and its reason is logged server-side; clients only ever see a
//! generic 403.

mod groups;
mod rules;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::request::Parts;
use tracing::debug;

use crate::authn::User;

pub use groups::GroupsAuthorizer;
pub use rules::{ConfigAuthorizer, RuleTable, RulesWatcher};

/// Group entry matching every group.
pub const WILDCARD: &str = "*";

/// Authorizer verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Why, for server logs
    pub reason: String,
}

impl Decision {
    /// Allow.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    /// Deny with `reason`.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Authorization policy failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthorizerError {
    /// The rules file could not be read.
    #[error("failed to read authorization rules {path}: {source}")]
    Read {
        /// Rules file path.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The rules file is not valid.
    #[error("failed to parse authorization rules: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The rules file could not be watched.
    #[error("failed to watch authorization rules: {0}")]
    Watch(#[from] notify::Error),
}

/// A pluggable access policy.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Decide whether `user` may make the request in `parts`.
    async fn authorize(&self, parts: &Parts, user: &User) -> Result<Decision, AuthorizerError>;
}

/// Authorizers that must all allow.
#[derive(Clone, Default)]
pub struct AuthorizerChain {
    authorizers: Vec<Arc<dyn Authorizer>>,
}

impl AuthorizerChain {
    /// Chain consulting `authorizers` front to back.
    #[must_use]
    pub fn new(authorizers: Vec<Arc<dyn Authorizer>>) -> Self {
        Self { authorizers }
    }

    /// Allow iff every authorizer allows. Stops at the first denial.
    pub async fn authorize(&self, parts: &Parts, user: &User) -> Result<Decision, AuthorizerError> {
        for authorizer in &self.authorizers {
            let decision = authorizer.authorize(parts, user).await?;
            if !decision.allowed {
                debug!(authorizer = authorizer.name(), reason = %decision.reason, "Request denied");
                return Ok(decision);
            }
        }
        Ok(Decision::allow())
    }
}

/// `true` if `allowed` contains the wildcard or any of `groups`.
pub(crate) fn groups_permitted<'a>(
    allowed: impl IntoIterator<Item = &'a String>,
    groups: &[String],
) -> bool {
    allowed
        .into_iter()
        .any(|g| g == WILDCARD || groups.contains(g))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    struct Fixed(bool);

    #[async_trait]
    impl Authorizer for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn authorize(&self, _parts: &Parts, _user: &User) -> Result<Decision, AuthorizerError> {
            Ok(if self.0 {
                Decision::allow()
            } else {
                Decision::deny("fixed deny")
            })
        }
    }

    fn parts() -> Parts {
        Request::builder().uri("/").body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn all_must_allow() {
        let user = User::default();
        let allow_all = AuthorizerChain::new(vec![Arc::new(Fixed(true)), Arc::new(Fixed(true))]);
        let one_denies = AuthorizerChain::new(vec![Arc::new(Fixed(true)), Arc::new(Fixed(false))]);

        assert!(allow_all.authorize(&parts(), &user).await.unwrap().allowed);
        let decision = one_denies.authorize(&parts(), &user).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "fixed deny");
    }

    #[tokio::test]
    async fn empty_chain_allows() {
        let chain = AuthorizerChain::default();
        assert!(chain.authorize(&parts(), &User::default()).await.unwrap().allowed);
    }

    #[test]
    fn wildcard_permits_any_groups() {
        let allowed = vec![WILDCARD.to_string()];
        assert!(groups_permitted(&allowed, &[]));
        assert!(groups_permitted(&allowed, &["x".to_string()]));
    }
}
