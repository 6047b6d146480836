//! Server-side session authentication.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderName;
use axum::http::request::Parts;
use axum_extra::extract::cookie::CookieJar;
use tracing::{debug, info, warn};

use super::{AuthResponse, Authentication, Authenticator, AuthenticatorError, User, bearer_token};
use crate::session::{SessionManager, UserSession, revoke_session};
use crate::store::SessionStore;

/// Session ID carried by the `cookie_name` cookie, or else by `auth_header`
/// with any `Bearer` prefix stripped.
#[must_use]
pub fn session_id(parts: &Parts, cookie_name: &str, auth_header: &HeaderName) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(cookie) = jar.get(cookie_name) {
        return Some(cookie.value().to_string()).filter(|v| !v.is_empty());
    }
    parts
        .headers
        .get(auth_header)
        .and_then(|v| v.to_str().ok())
        .map(bearer_token)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolves the session named by the request's cookie or auth header.
pub struct SessionAuthenticator {
    store: SessionStore<UserSession>,
    manager: Arc<dyn SessionManager>,
    cookie_name: String,
    auth_header: HeaderName,
    strict_validation: bool,
}

impl SessionAuthenticator {
    /// Authenticator over `store`.
    ///
    /// With `strict_validation` every request re-checks the session's access
    /// token against the provider's UserInfo endpoint.
    #[must_use]
    pub fn new(
        store: SessionStore<UserSession>,
        manager: Arc<dyn SessionManager>,
        cookie_name: String,
        auth_header: HeaderName,
        strict_validation: bool,
    ) -> Self {
        Self {
            store,
            manager,
            cookie_name,
            auth_header,
            strict_validation,
        }
    }

    /// Session ID presented by the request.
    #[must_use]
    pub fn session_id(&self, parts: &Parts) -> Option<String> {
        session_id(parts, &self.cookie_name, &self.auth_header)
    }

    /// Renew expired tokens and confirm the access token is still accepted.
    ///
    /// Returns `Ok(false)` when the provider reports the token as revoked,
    /// in which case the session has been revoked locally too, or when the
    /// session was deleted while a refresh was in flight.
    async fn revalidate(&self, session_id: &str, session: &mut UserSession) -> Result<bool, AuthenticatorError> {
        if session.tokens.is_expired() {
            if let Some(refresh_token) = session.tokens.refresh_token.clone() {
                match self.manager.refresh(&refresh_token).await {
                    Ok(fresh) => {
                        session.tokens = session.tokens.clone().refreshed(fresh);
                        if !self.store.save(session_id, session).await? {
                            info!(user = %session.user_id, "Session ended while its tokens were refreshed");
                            return Ok(false);
                        }
                        debug!(user = %session.user_id, "Session tokens refreshed");
                    }
                    Err(e) if e.status().is_some_and(|s| (400..500).contains(&s)) => {
                        info!(user = %session.user_id, error = %e, "Refresh rejected, login expired");
                        revoke_session(&self.manager, &self.store, session_id, session).await?;
                        return Err(AuthenticatorError::LoginExpired);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        match self.manager.user_info(&session.tokens.access_token).await {
            Ok(_) => Ok(true),
            Err(e) if e.status() == Some(401) => {
                info!(user = %session.user_id, "UserInfo token has expired");
                // Only the request is visible here, so the stale cookie stays
                // in the browser until the next login replaces it.
                if let Err(e) = revoke_session(&self.manager, &self.store, session_id, session).await {
                    warn!(error = %e, "Failed to revoke expired session");
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn authenticate(&self, parts: &Parts) -> Result<Authentication, AuthenticatorError> {
        let Some(session_id) = self.session_id(parts) else {
            return Ok(Authentication::PassThrough);
        };
        let Some(mut session) = self.store.get(&session_id).await? else {
            debug!("No session found for presented ID");
            return Ok(Authentication::PassThrough);
        };

        if self.strict_validation && !self.revalidate(&session_id, &mut session).await? {
            return Ok(Authentication::PassThrough);
        }

        let user = User::new(session.user_id, session.groups);
        Ok(Authentication::Authenticated(AuthResponse::new(user)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::http::Request;
    use axum::http::header::AUTHORIZATION;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::{Claims, OAuth2Tokens, ProviderError};
    use crate::store::{InMemoryBackend, USER_SESSION_BUCKET};

    /// Provider fake: UserInfo answers with `userinfo_status`, refresh with `refresh_status`.
    struct FakeProvider {
        userinfo_status: u16,
        refresh_status: u16,
        userinfo_calls: AtomicUsize,
        /// Session deleted while a refresh is in flight, as a racing logout would
        logout_during_refresh: parking_lot::Mutex<Option<(SessionStore<UserSession>, String)>>,
    }

    impl FakeProvider {
        fn new(userinfo_status: u16, refresh_status: u16) -> Arc<Self> {
            Arc::new(Self {
                userinfo_status,
                refresh_status,
                userinfo_calls: AtomicUsize::new(0),
                logout_during_refresh: parking_lot::Mutex::new(None),
            })
        }
    }

    fn status_result<T>(status: u16, ok: T) -> Result<T, ProviderError> {
        if status == 200 {
            Ok(ok)
        } else {
            Err(ProviderError::Request {
                status,
                body: String::new(),
            })
        }
    }

    #[async_trait]
    impl SessionManager for FakeProvider {
        fn authorization_url(&self, state: &str) -> String {
            format!("https://idp.example.com/auth?state={state}")
        }

        fn client_id(&self) -> &str {
            "authservice"
        }

        async fn exchange_code(&self, _code: &str) -> Result<OAuth2Tokens, ProviderError> {
            Err(ProviderError::Unsupported("exchange"))
        }

        async fn verify_id_token(&self, _raw: &str, _audience: Option<&str>) -> Result<Claims, ProviderError> {
            Err(ProviderError::MissingKeyId)
        }

        async fn user_info(&self, _access_token: &str) -> Result<Claims, ProviderError> {
            self.userinfo_calls.fetch_add(1, Ordering::SeqCst);
            status_result(self.userinfo_status, Claims::default())
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<OAuth2Tokens, ProviderError> {
            let logout = self.logout_during_refresh.lock().take();
            if let Some((store, id)) = logout {
                store.delete(&id).await.unwrap();
            }
            status_result(
                self.refresh_status,
                OAuth2Tokens {
                    access_token: "fresh".to_string(),
                    token_type: "Bearer".to_string(),
                    refresh_token: None,
                    id_token: None,
                    expires_at: None,
                },
            )
        }

        async fn revoke_tokens(&self, _tokens: &OAuth2Tokens) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn store() -> SessionStore<UserSession> {
        SessionStore::new(Arc::new(InMemoryBackend::new()), USER_SESSION_BUCKET, Duration::from_secs(3600))
    }

    fn session(groups: Vec<String>, expires_at: Option<i64>) -> UserSession {
        UserSession::new(
            "alice@example.com".to_string(),
            groups,
            OAuth2Tokens {
                access_token: "stored".to_string(),
                token_type: "Bearer".to_string(),
                refresh_token: Some("rt".to_string()),
                id_token: None,
                expires_at,
            },
        )
    }

    fn authenticator(
        store: &SessionStore<UserSession>,
        provider: Arc<FakeProvider>,
        strict: bool,
    ) -> SessionAuthenticator {
        SessionAuthenticator::new(
            store.clone(),
            provider,
            "authservice_session".to_string(),
            AUTHORIZATION,
            strict,
        )
    }

    fn with_cookie(id: &str) -> Parts {
        Request::builder()
            .uri("/")
            .header("cookie", format!("authservice_session={id}"))
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[tokio::test]
    async fn valid_session_cookie_authenticates() {
        // GIVEN: a stored session for alice in "admins"
        let store = store();
        let id = store.create(&session(vec!["admins".to_string()], None)).await.unwrap();
        let authn = authenticator(&store, FakeProvider::new(200, 200), false);

        // WHEN: the request presents the cookie
        let outcome = authn.authenticate(&with_cookie(&id)).await.unwrap();

        // THEN: identity comes from the session
        let Authentication::Authenticated(response) = outcome else {
            panic!("expected authentication");
        };
        assert_eq!(response.user, User::new("alice@example.com", vec!["admins".to_string()]));
    }

    #[tokio::test]
    async fn session_id_in_auth_header_is_accepted() {
        let store = store();
        let id = store.create(&session(vec![], None)).await.unwrap();
        let authn = authenticator(&store, FakeProvider::new(200, 200), false);
        let parts = Request::builder()
            .uri("/")
            .header(AUTHORIZATION, format!("Bearer {id}"))
            .body(())
            .unwrap()
            .into_parts()
            .0;

        assert!(matches!(
            authn.authenticate(&parts).await.unwrap(),
            Authentication::Authenticated(_)
        ));
    }

    #[tokio::test]
    async fn unknown_session_passes_through() {
        let authn = authenticator(&store(), FakeProvider::new(200, 200), false);
        assert!(matches!(
            authn.authenticate(&with_cookie("nope")).await.unwrap(),
            Authentication::PassThrough
        ));
    }

    #[tokio::test]
    async fn lenient_mode_never_calls_provider() {
        let store = store();
        let id = store.create(&session(vec![], None)).await.unwrap();
        let provider = FakeProvider::new(401, 200);
        let authn = authenticator(&store, provider.clone(), false);

        assert!(matches!(
            authn.authenticate(&with_cookie(&id)).await.unwrap(),
            Authentication::Authenticated(_)
        ));
        assert_eq!(provider.userinfo_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn strict_mode_revokes_on_unauthorized() {
        // GIVEN: strict validation and a provider reporting the token revoked
        let store = store();
        let id = store.create(&session(vec![], None)).await.unwrap();
        let authn = authenticator(&store, FakeProvider::new(401, 200), true);

        // WHEN: the session is used
        let outcome = authn.authenticate(&with_cookie(&id)).await.unwrap();

        // THEN: pass-through, and the record is gone
        assert!(matches!(outcome, Authentication::PassThrough));
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn strict_mode_other_provider_failure_is_fatal() {
        let store = store();
        let id = store.create(&session(vec![], None)).await.unwrap();
        let authn = authenticator(&store, FakeProvider::new(503, 200), true);

        assert!(matches!(
            authn.authenticate(&with_cookie(&id)).await,
            Err(AuthenticatorError::Provider(_))
        ));
        assert!(store.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn strict_mode_refreshes_expired_tokens() {
        // GIVEN: an expired access token with a refresh token
        let store = store();
        let id = store
            .create(&session(vec![], Some(chrono::Utc::now().timestamp() - 10)))
            .await
            .unwrap();
        let authn = authenticator(&store, FakeProvider::new(200, 200), true);

        // WHEN: authenticating
        let outcome = authn.authenticate(&with_cookie(&id)).await.unwrap();

        // THEN: the session is accepted and the fresh token persisted
        assert!(matches!(outcome, Authentication::Authenticated(_)));
        let saved = store.get(&id).await.unwrap().unwrap();
        assert_eq!(saved.tokens.access_token, "fresh");
        assert_eq!(saved.tokens.refresh_token.as_deref(), Some("rt"));
    }

    #[tokio::test]
    async fn logout_during_refresh_is_not_undone() {
        // GIVEN: an expired session that is logged out while its refresh runs
        let store = store();
        let id = store
            .create(&session(vec![], Some(chrono::Utc::now().timestamp() - 10)))
            .await
            .unwrap();
        let provider = FakeProvider::new(200, 200);
        *provider.logout_during_refresh.lock() = Some((store.clone(), id.clone()));
        let authn = authenticator(&store, provider.clone(), true);

        // WHEN: the session is used
        let outcome = authn.authenticate(&with_cookie(&id)).await.unwrap();

        // THEN: no identity, and the session stays gone
        assert!(matches!(outcome, Authentication::PassThrough));
        assert!(store.get(&id).await.unwrap().is_none());
        assert_eq!(provider.userinfo_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_expires_login() {
        let store = store();
        let id = store
            .create(&session(vec![], Some(chrono::Utc::now().timestamp() - 10)))
            .await
            .unwrap();
        let authn = authenticator(&store, FakeProvider::new(200, 400), true);

        assert!(matches!(
            authn.authenticate(&with_cookie(&id)).await,
            Err(AuthenticatorError::LoginExpired)
        ));
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn legacy_session_without_groups_authenticates_with_none() {
        // GIVEN: a record written before group capture existed
        let backend = Arc::new(InMemoryBackend::new());
        let legacy: SessionStore<serde_json::Value> =
            SessionStore::new(backend.clone(), USER_SESSION_BUCKET, Duration::from_secs(3600));
        let id = legacy
            .create(&serde_json::json!({
                "user_id": "old-timer",
                "tokens": {"access_token": "at"},
                "created_at": "2020-01-01T00:00:00Z"
            }))
            .await
            .unwrap();
        let store: SessionStore<UserSession> =
            SessionStore::new(backend, USER_SESSION_BUCKET, Duration::from_secs(3600));
        let authn = authenticator(&store, FakeProvider::new(200, 200), false);

        // WHEN/THEN: it authenticates with an empty group set
        let Authentication::Authenticated(response) = authn.authenticate(&with_cookie(&id)).await.unwrap() else {
            panic!("expected authentication");
        };
        assert_eq!(response.user.name, "old-timer");
        assert!(response.user.groups.is_empty());
    }
}
