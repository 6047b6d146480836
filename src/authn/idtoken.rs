//! Bearer ID token authentication.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue};
use tracing::{debug, info, warn};

use super::{AUTH_METHOD_KEY, AuthResponse, Authentication, Authenticator, AuthenticatorError, User, bearer_token};
use crate::session::SessionManager;

/// Accepts an OIDC ID token presented in a request header.
///
/// The token's audience is not checked, so tokens minted for any client of
/// the provider are accepted.
pub struct IdTokenAuthenticator {
    manager: Arc<dyn SessionManager>,
    header: HeaderName,
    user_id_claim: String,
    groups_claim: String,
    token_header: HeaderName,
    token_scheme: String,
}

impl IdTokenAuthenticator {
    /// Authenticator reading the token from `header` and re-emitting it on
    /// `token_header`, prefixed by `token_scheme` when non-empty.
    #[must_use]
    pub fn new(
        manager: Arc<dyn SessionManager>,
        header: HeaderName,
        user_id_claim: String,
        groups_claim: String,
        token_header: HeaderName,
        token_scheme: String,
    ) -> Self {
        Self {
            manager,
            header,
            user_id_claim,
            groups_claim,
            token_header,
            token_scheme,
        }
    }
}

#[async_trait]
impl Authenticator for IdTokenAuthenticator {
    fn name(&self) -> &'static str {
        "idtoken"
    }

    async fn authenticate(&self, parts: &Parts) -> Result<Authentication, AuthenticatorError> {
        let bearer = parts
            .headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(bearer_token)
            .unwrap_or_default();
        if bearer.is_empty() {
            debug!(header = %self.header, "No bearer token found");
            return Ok(Authentication::PassThrough);
        }

        let claims = match self.manager.verify_without_audience(bearer).await {
            Ok(claims) => claims,
            Err(e) => {
                warn!(error = %e, "ID token verification failed");
                return Ok(Authentication::PassThrough);
            }
        };

        let mut response = AuthResponse::default();
        let value = if self.token_scheme.is_empty() {
            bearer.to_string()
        } else {
            format!("{} {bearer}", self.token_scheme)
        };
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                response.headers.insert(self.token_header.clone(), value);
            }
            Err(e) => warn!(error = %e, "ID token is not a valid header value"),
        }

        let Some(user_id) = claims.string(&self.user_id_claim) else {
            // Client-credential tokens carry no subject
            info!(claim = %self.user_id_claim, "User ID claim missing from ID token");
            return Ok(Authentication::Authenticated(response));
        };

        let mut user = User::new(user_id, claims.strings(&self.groups_claim).unwrap_or_default());
        user.extra
            .insert(AUTH_METHOD_KEY.to_string(), vec!["header".to_string()]);
        response.user = user;
        Ok(Authentication::Authenticated(response))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use axum::http::header::AUTHORIZATION;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::provider::tests::{TEST_ISSUER, sign, verifier};
    use crate::session::{Claims, OAuth2Tokens, ProviderError};

    /// Verifies with the real ES256 test verifier; everything else is unused.
    struct VerifyingProvider;

    #[async_trait]
    impl SessionManager for VerifyingProvider {
        fn authorization_url(&self, _state: &str) -> String {
            String::new()
        }

        fn client_id(&self) -> &str {
            "authservice"
        }

        async fn exchange_code(&self, _code: &str) -> Result<OAuth2Tokens, ProviderError> {
            Err(ProviderError::Unsupported("exchange"))
        }

        async fn verify_id_token(&self, raw: &str, audience: Option<&str>) -> Result<Claims, ProviderError> {
            verifier().verify(raw, audience).await
        }

        async fn user_info(&self, _access_token: &str) -> Result<Claims, ProviderError> {
            Err(ProviderError::Unsupported("userinfo"))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<OAuth2Tokens, ProviderError> {
            Err(ProviderError::Unsupported("refresh"))
        }

        async fn revoke_tokens(&self, _tokens: &OAuth2Tokens) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn authenticator(token_scheme: &str) -> IdTokenAuthenticator {
        IdTokenAuthenticator::new(
            Arc::new(VerifyingProvider),
            AUTHORIZATION,
            "email".to_string(),
            "groups".to_string(),
            AUTHORIZATION,
            token_scheme.to_string(),
        )
    }

    fn token(claims: serde_json::Value) -> String {
        let mut body = serde_json::json!({
            "iss": TEST_ISSUER,
            "aud": "some-other-client",
            "exp": chrono::Utc::now().timestamp() + 300,
        });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), claims.as_object()) {
            body.extend(extra.clone());
        }
        sign(&body, "test-key")
    }

    fn request(authorization: &str) -> Parts {
        Request::builder()
            .uri("/")
            .header(AUTHORIZATION, authorization)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[tokio::test]
    async fn valid_token_yields_user_with_header_method() {
        // GIVEN: a token for another client carrying email and groups
        let raw = token(serde_json::json!({"email": "alice@example.com", "groups": ["eng"]}));

        // WHEN: presented as a bearer token
        let outcome = authenticator("Bearer").authenticate(&request(&format!("Bearer {raw}"))).await.unwrap();

        // THEN: identity from claims, marked as header-authenticated, token re-emitted
        let Authentication::Authenticated(response) = outcome else {
            panic!("expected authentication");
        };
        assert_eq!(response.user.name, "alice@example.com");
        assert_eq!(response.user.groups, vec!["eng".to_string()]);
        assert_eq!(response.user.auth_method(), Some("header"));
        assert_eq!(response.headers[AUTHORIZATION], format!("Bearer {raw}"));
    }

    #[tokio::test]
    async fn token_without_user_claim_is_anonymous_but_handled() {
        let raw = token(serde_json::json!({"sub": "client-credentials-app"}));

        let outcome = authenticator("").authenticate(&request(&raw)).await.unwrap();

        let Authentication::Authenticated(response) = outcome else {
            panic!("expected authentication");
        };
        assert_eq!(response.user, User::default());
        assert_eq!(response.headers[AUTHORIZATION], raw.as_str());
    }

    #[tokio::test]
    async fn invalid_token_passes_through() {
        let outcome = authenticator("Bearer")
            .authenticate(&request("Bearer not.a.jwt"))
            .await
            .unwrap();
        assert!(matches!(outcome, Authentication::PassThrough));
    }

    #[tokio::test]
    async fn missing_header_passes_through() {
        let parts = Request::builder().uri("/").body(()).unwrap().into_parts().0;
        let outcome = authenticator("Bearer").authenticate(&parts).await.unwrap();
        assert!(matches!(outcome, Authentication::PassThrough));
    }
}
