//! Service-account token authentication via the Kubernetes TokenReview API.
//!
//! Trust is delegated entirely to the cluster. A token the cluster does not
//! accept, or a review that fails, is never fatal here: the request passes
//! on so other authenticators get a chance.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::{Api, Client};
use tracing::{debug, warn};

use super::{AuthResponse, Authentication, Authenticator, AuthenticatorError, User, bearer_token};

/// TokenReview call failures.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    /// The API server request failed.
    #[error("TokenReview API error: {0}")]
    Kube(#[from] kube::Error),

    /// The API server answered without a status.
    #[error("TokenReview returned no status")]
    MissingStatus,
}

/// Submits bearer tokens to the cluster for review.
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    /// Review `token` for `audiences`. `Ok(None)` means the cluster did not
    /// authenticate it.
    async fn review(&self, token: &str, audiences: &[String]) -> Result<Option<User>, ReviewError>;
}

/// [`TokenReviewer`] backed by the in-cluster API server.
pub struct KubeTokenReviewer {
    client: Client,
}

impl KubeTokenReviewer {
    /// Reviewer using `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Reviewer using the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, ReviewError> {
        Ok(Self::new(Client::try_default().await?))
    }
}

#[async_trait]
impl TokenReviewer for KubeTokenReviewer {
    async fn review(&self, token: &str, audiences: &[String]) -> Result<Option<User>, ReviewError> {
        let api: Api<TokenReview> = Api::all(self.client.clone());

        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: (!audiences.is_empty()).then(|| audiences.to_vec()),
            },
            status: None,
        };

        let result = api.create(&Default::default(), &review).await?;
        let status = result.status.ok_or(ReviewError::MissingStatus)?;
        Ok(user_from_status(&status))
    }
}

/// Identity from a review status, if the cluster authenticated the token.
fn user_from_status(status: &TokenReviewStatus) -> Option<User> {
    if !status.authenticated.unwrap_or(false) {
        debug!(
            reason = status.error.as_deref().unwrap_or("not authenticated"),
            "TokenReview rejected token"
        );
        return None;
    }

    let info = status.user.as_ref()?;
    let mut user = User::new(
        info.username.clone().unwrap_or_default(),
        info.groups.clone().unwrap_or_default(),
    );
    if let Some(extra) = &info.extra {
        user.extra = extra.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    }
    Some(user)
}

/// Authenticates in-cluster service-account bearer tokens.
pub struct KubernetesAuthenticator {
    reviewer: Arc<dyn TokenReviewer>,
    audiences: Vec<String>,
}

impl KubernetesAuthenticator {
    /// Authenticator restricted to `audiences` (empty means the API server default).
    #[must_use]
    pub fn new(reviewer: Arc<dyn TokenReviewer>, audiences: Vec<String>) -> Self {
        Self { reviewer, audiences }
    }
}

#[async_trait]
impl Authenticator for KubernetesAuthenticator {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn authenticate(&self, parts: &Parts) -> Result<Authentication, AuthenticatorError> {
        let Some(header) = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return Ok(Authentication::PassThrough);
        };
        let token = bearer_token(header);
        if token.is_empty() {
            return Ok(Authentication::PassThrough);
        }

        match self.reviewer.review(token, &self.audiences).await {
            Ok(Some(user)) => Ok(Authentication::Authenticated(AuthResponse::new(user))),
            Ok(None) => Ok(Authentication::PassThrough),
            Err(e) => {
                warn!(error = %e, "TokenReview failed, passing to next authenticator");
                Ok(Authentication::PassThrough)
            }
        }
    }
}
