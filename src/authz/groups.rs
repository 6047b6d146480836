//! Static group allowlist authorizer.

use std::collections::BTreeSet;

use async_trait::async_trait;
use axum::http::request::Parts;

use super::{Authorizer, AuthorizerError, Decision, groups_permitted};
use crate::authn::User;

/// Allows users in at least one allowlisted group.
pub struct GroupsAuthorizer {
    allowlist: BTreeSet<String>,
}

impl GroupsAuthorizer {
    /// Authorizer over `allowlist`; `*` allows everyone.
    #[must_use]
    pub fn new(allowlist: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowlist: allowlist.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authorizer for GroupsAuthorizer {
    fn name(&self) -> &'static str {
        "groups"
    }

    async fn authorize(&self, _parts: &Parts, user: &User) -> Result<Decision, AuthorizerError> {
        if groups_permitted(&self.allowlist, &user.groups) {
            return Ok(Decision::allow());
        }

        let shared: Vec<&str> = user
            .groups
            .iter()
            .filter(|g| self.allowlist.contains(g.as_str()))
            .map(String::as_str)
            .collect();
        Ok(Decision::deny(format!(
            "user '{}' groups [{}] intersect the allowlist in [{}]",
            user.name,
            user.groups.join(", "),
            shared.join(", ")
        )))
    }
}
