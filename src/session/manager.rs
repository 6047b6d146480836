//! Session manager: the service's side of the OIDC conversation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use super::provider::{Claims, IdTokenVerifier, ProviderError, ProviderMetadata};
use super::tokens::{OAuth2Tokens, TokenResponse, UserSession};
use crate::config::OidcConfig;
use crate::store::{SessionStore, StoreError};
use crate::{Error, Result};

/// Identity-provider operations needed by the pipeline and authenticators.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Provider URL to send the browser to for login.
    fn authorization_url(&self, state: &str) -> String;

    /// Client ID this service is registered as.
    fn client_id(&self) -> &str;

    /// Authorization-code exchange.
    async fn exchange_code(&self, code: &str) -> std::result::Result<OAuth2Tokens, ProviderError>;

    /// Verify an ID token's signature, issuer, and expiry, plus `aud` when
    /// `audience` is given.
    async fn verify_id_token(
        &self,
        raw: &str,
        audience: Option<&str>,
    ) -> std::result::Result<Claims, ProviderError>;

    /// Verify an ID token minted for any client of this issuer.
    async fn verify_without_audience(&self, raw: &str) -> std::result::Result<Claims, ProviderError> {
        self.verify_id_token(raw, None).await
    }

    /// Fetch UserInfo claims. Non-2xx answers surface as
    /// [`ProviderError::Request`] carrying the status.
    async fn user_info(&self, access_token: &str) -> std::result::Result<Claims, ProviderError>;

    /// Trade a refresh token for fresh tokens.
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<OAuth2Tokens, ProviderError>;

    /// Invalidate tokens at the provider, if it supports revocation.
    async fn revoke_tokens(&self, tokens: &OAuth2Tokens) -> std::result::Result<(), ProviderError>;
}

/// Revoke a session.
///
/// The local record is deleted before returning. Provider-side revocation
/// runs in the background and only logs on failure.
pub async fn revoke_session(
    manager: &Arc<dyn SessionManager>,
    store: &SessionStore<UserSession>,
    session_id: &str,
    session: &UserSession,
) -> std::result::Result<(), StoreError> {
    store.delete(session_id).await?;
    info!(user = %session.user_id, "Session revoked");

    let manager = Arc::clone(manager);
    let tokens = session.tokens.clone();
    let user = session.user_id.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.revoke_tokens(&tokens).await {
            warn!(user = %user, error = %e, "Provider-side token revocation failed");
        }
    });
    Ok(())
}

/// [`SessionManager`] talking to a discovered OIDC provider.
pub struct OidcSessionManager {
    http: Client,
    metadata: ProviderMetadata,
    auth_endpoint: Url,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    scopes: Vec<String>,
    verifier: IdTokenVerifier,
}

impl OidcSessionManager {
    /// Build from discovered metadata.
    ///
    /// `config.auth_url`, when set, replaces the discovered authorization
    /// endpoint.
    pub fn new(http: Client, metadata: ProviderMetadata, config: &OidcConfig) -> Result<Self> {
        let auth_endpoint = config
            .auth_url
            .as_deref()
            .unwrap_or(&metadata.authorization_endpoint);
        let auth_endpoint = Url::parse(auth_endpoint)
            .map_err(|e| Error::Config(format!("Invalid authorization endpoint '{auth_endpoint}': {e}")))?;

        let verifier = IdTokenVerifier::new(
            metadata.issuer.clone(),
            metadata.jwks_uri.clone(),
            http.clone(),
        );

        Ok(Self {
            http,
            metadata,
            auth_endpoint,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_url: config.redirect_url.clone(),
            scopes: config.scopes.clone(),
            verifier,
        })
    }

    /// Replace the ID token verifier (e.g. one pre-seeded with keys).
    #[must_use]
    pub fn with_verifier(mut self, verifier: IdTokenVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Discovered provider metadata.
    #[must_use]
    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn token_request(
        &self,
        params: &HashMap<&str, &str>,
    ) -> std::result::Result<OAuth2Tokens, ProviderError> {
        let response = self
            .http
            .post(&self.metadata.token_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request { status, body });
        }

        let token_response: TokenResponse = response.json().await?;
        Ok(OAuth2Tokens::from_response(token_response))
    }
}

#[async_trait]
impl SessionManager for OidcSessionManager {
    fn authorization_url(&self, state: &str) -> String {
        let mut url = self.auth_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);
        url.into()
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn exchange_code(&self, code: &str) -> std::result::Result<OAuth2Tokens, ProviderError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", self.redirect_url.as_str());

        let tokens = self.token_request(&params).await?;
        debug!("Exchanged authorization code");
        Ok(tokens)
    }

    async fn verify_id_token(
        &self,
        raw: &str,
        audience: Option<&str>,
    ) -> std::result::Result<Claims, ProviderError> {
        self.verifier.verify(raw, audience).await
    }

    async fn user_info(&self, access_token: &str) -> std::result::Result<Claims, ProviderError> {
        let endpoint = self
            .metadata
            .userinfo_endpoint
            .as_deref()
            .ok_or(ProviderError::Unsupported("userinfo"))?;

        let response = self.http.get(endpoint).bearer_auth(access_token).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request { status, body });
        }

        Ok(response.json().await?)
    }

    async fn refresh(&self, refresh_token: &str) -> std::result::Result<OAuth2Tokens, ProviderError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);

        let tokens = self.token_request(&params).await?;
        debug!("Refreshed session tokens");
        Ok(tokens)
    }

    async fn revoke_tokens(&self, tokens: &OAuth2Tokens) -> std::result::Result<(), ProviderError> {
        let Some(endpoint) = self.metadata.revocation_endpoint.as_deref() else {
            debug!("Provider has no revocation endpoint, skipping");
            return Ok(());
        };

        // Revoking the refresh token also invalidates its access tokens (RFC 7009 §2.1)
        let (token, hint) = match &tokens.refresh_token {
            Some(refresh) => (refresh.as_str(), "refresh_token"),
            None => (tokens.access_token.as_str(), "access_token"),
        };
        let mut params = HashMap::new();
        params.insert("token", token);
        params.insert("token_type_hint", hint);

        let response = self
            .http
            .post(endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request { status, body });
        }
        debug!(hint, "Revoked token at provider");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::extract::Form;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::{InMemoryBackend, USER_SESSION_BUCKET};

    /// Minimal provider: token endpoint, and a UserInfo endpoint that only
    /// accepts access token "good".
    async fn spawn_provider() -> String {
        async fn token(Form(form): Form<HashMap<String, String>>) -> (StatusCode, Json<serde_json::Value>) {
            match form.get("grant_type").map(String::as_str) {
                Some("authorization_code") if form.get("code").map(String::as_str) == Some("good-code") => (
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "access_token": "good",
                        "token_type": "Bearer",
                        "expires_in": 3600,
                        "refresh_token": "rt",
                        "id_token": "idt"
                    })),
                ),
                Some("refresh_token") => (
                    StatusCode::OK,
                    Json(serde_json::json!({"access_token": "refreshed", "expires_in": 60})),
                ),
                _ => (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "invalid_grant"})),
                ),
            }
        }

        async fn userinfo(headers: HeaderMap) -> (StatusCode, Json<serde_json::Value>) {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if auth == "Bearer good" {
                (StatusCode::OK, Json(serde_json::json!({"sub": "alice"})))
            } else {
                (StatusCode::UNAUTHORIZED, Json(serde_json::json!({})))
            }
        }

        let app = Router::new()
            .route("/token", post(token))
            .route("/userinfo", get(userinfo));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn manager(base: &str) -> OidcSessionManager {
        let metadata = ProviderMetadata {
            issuer: base.to_string(),
            authorization_endpoint: format!("{base}/auth"),
            token_endpoint: format!("{base}/token"),
            jwks_uri: format!("{base}/keys"),
            userinfo_endpoint: Some(format!("{base}/userinfo")),
            revocation_endpoint: None,
            scopes_supported: vec![],
        };
        let config = OidcConfig {
            provider_url: base.to_string(),
            client_id: "authservice".to_string(),
            client_secret: "secret".to_string(),
            redirect_url: "https://app.example.com/authservice/oidc/callback".to_string(),
            ..OidcConfig::default()
        };
        OidcSessionManager::new(Client::new(), metadata, &config).unwrap()
    }

    #[tokio::test]
    async fn exchange_code_returns_tokens() {
        let base = spawn_provider().await;
        let tokens = manager(&base).exchange_code("good-code").await.unwrap();

        assert_eq!(tokens.access_token, "good");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        assert_eq!(tokens.id_token.as_deref(), Some("idt"));
    }

    #[tokio::test]
    async fn rejected_code_is_provider_error_with_status() {
        let base = spawn_provider().await;
        let err = manager(&base).exchange_code("bad-code").await.unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[tokio::test]
    async fn user_info_distinguishes_unauthorized() {
        // GIVEN: a provider accepting only the "good" token
        let base = spawn_provider().await;
        let manager = manager(&base);

        // THEN: valid token yields claims, revoked one yields status 401
        let claims = manager.user_info("good").await.unwrap();
        assert_eq!(claims.string("sub"), Some("alice"));
        let err = manager.user_info("revoked").await.unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn refresh_returns_new_access_token() {
        let base = spawn_provider().await;
        let tokens = manager(&base).refresh("rt").await.unwrap();
        assert_eq!(tokens.access_token, "refreshed");
        assert!(tokens.refresh_token.is_none());
    }

    #[tokio::test]
    async fn unreachable_provider_is_transport_error() {
        let err = manager("http://127.0.0.1:1").user_info("good").await.unwrap_err();
        assert!(matches!(err, ProviderError::Http(_)));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn authorization_url_carries_client_and_state() {
        let url = manager("https://idp.example.com").authorization_url("abc.defghijk");
        let parsed = Url::parse(&url).unwrap();
        let query: HashMap<_, _> = parsed.query_pairs().into_owned().collect();

        assert_eq!(parsed.path(), "/auth");
        assert_eq!(query["client_id"], "authservice");
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["state"], "abc.defghijk");
        assert_eq!(query["scope"], "openid email groups");
    }

    #[test]
    fn auth_url_override_replaces_discovered_endpoint() {
        let metadata = ProviderMetadata {
            issuer: "https://idp.example.com".to_string(),
            authorization_endpoint: "https://idp.example.com/auth".to_string(),
            token_endpoint: "https://idp.example.com/token".to_string(),
            jwks_uri: "https://idp.example.com/keys".to_string(),
            userinfo_endpoint: None,
            revocation_endpoint: None,
            scopes_supported: vec![],
        };
        let config = OidcConfig {
            auth_url: Some("https://login.example.com/authorize".to_string()),
            ..OidcConfig::default()
        };
        let manager = OidcSessionManager::new(Client::new(), metadata, &config).unwrap();

        assert!(manager
            .authorization_url("s")
            .starts_with("https://login.example.com/authorize?"));
    }

    #[tokio::test]
    async fn revoke_session_deletes_locally_even_when_provider_fails() {
        // GIVEN: a stored session and an unreachable provider with a revocation endpoint
        let store: SessionStore<UserSession> = SessionStore::new(
            Arc::new(InMemoryBackend::new()),
            USER_SESSION_BUCKET,
            Duration::from_secs(60),
        );
        let session = UserSession::new(
            "alice".to_string(),
            vec![],
            OAuth2Tokens {
                access_token: "at".to_string(),
                token_type: "Bearer".to_string(),
                refresh_token: Some("rt".to_string()),
                id_token: None,
                expires_at: None,
            },
        );
        let id = store.create(&session).await.unwrap();
        let mut unreachable = manager("http://127.0.0.1:1");
        unreachable.metadata.revocation_endpoint = Some("http://127.0.0.1:1/revoke".to_string());
        let manager: Arc<dyn SessionManager> = Arc::new(unreachable);

        // WHEN: revoking
        revoke_session(&manager, &store, &id, &session).await.unwrap();

        // THEN: the local record is gone regardless
        assert!(store.get(&id).await.unwrap().is_none());
    }
}
