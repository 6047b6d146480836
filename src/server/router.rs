//! HTTP routes: the authentication pipeline, OIDC callback, and logout.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::authn::{AuthResponse, AuthenticatorChain, AuthenticatorError, session_id};
use crate::authz::AuthorizerChain;
use crate::config::Config;
use crate::session::{CookiePolicy, SessionManager, StateCodec, StateError, UserSession, revoke_session};
use crate::store::SessionStore;
use crate::transformer::UserIdTransformer;
use crate::{Error, Result};

use super::readiness::Readiness;

/// Path of the OIDC callback under the URL prefix
pub const CALLBACK_PATH: &str = "/oidc/callback";

/// Path of the logout endpoint under the URL prefix
pub const LOGOUT_PATH: &str = "/logout";

/// Request-invariant settings resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// URL prefix for the callback and logout routes, without trailing slash
    pub prefix: String,
    /// Path prefixes answered 200 without authentication
    pub skip_auth_urls: Vec<String>,
    /// Session cookie name
    pub session_cookie: String,
    /// Header that may carry a session id
    pub session_header: HeaderName,
    /// Session cookie lifetime
    pub session_max_age: Duration,
    /// Claim holding the user id in the login ID token
    pub user_id_claim: String,
    /// Claim holding groups in the login ID token
    pub groups_claim: String,
    /// Upstream user id header
    pub user_id_header: HeaderName,
    /// Prefix for the upstream user id
    pub user_id_prefix: String,
    /// Upstream groups header
    pub groups_header: HeaderName,
    /// Upstream authentication-method header
    pub auth_method_header: Option<HeaderName>,
    /// User id rewrites
    pub user_id_transformer: UserIdTransformer,
    /// Landing page after login
    pub after_login_url: Option<String>,
    /// Landing page after logout
    pub after_logout_url: String,
}

impl PipelineSettings {
    /// Resolve header names and compile rewrite rules.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            prefix: config.server.prefix().to_string(),
            skip_auth_urls: config.server.skip_auth_urls.clone(),
            session_cookie: config.session.cookie_name.clone(),
            session_header: parse_header_name(&config.session.auth_header)?,
            session_max_age: config.session.max_age,
            user_id_claim: config.oidc.user_id_claim.clone(),
            groups_claim: config.oidc.groups_claim.clone(),
            user_id_header: parse_header_name(&config.headers.user_id_header)?,
            user_id_prefix: config.headers.user_id_prefix.clone(),
            groups_header: parse_header_name(&config.headers.groups_header)?,
            auth_method_header: config
                .headers
                .auth_method_header
                .as_deref()
                .map(parse_header_name)
                .transpose()?,
            user_id_transformer: UserIdTransformer::new(&config.user_id_transformer)?,
            after_login_url: config.after_login_url.clone(),
            after_logout_url: config.after_logout_url.clone(),
        })
    }

    fn is_skipped(&self, path: &str) -> bool {
        self.skip_auth_urls
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
    }
}

/// Parse a configured header name.
pub fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Config(format!("Invalid header name '{name}': {e}")))
}

/// Shared state for request handlers
pub struct AppState {
    /// Startup completion flag
    pub readiness: Readiness,
    /// Configured authenticators
    pub authenticators: AuthenticatorChain,
    /// Configured authorizers
    pub authorizers: AuthorizerChain,
    /// Identity provider
    pub manager: Arc<dyn SessionManager>,
    /// User sessions
    pub sessions: SessionStore<UserSession>,
    /// Login state issuance and verification
    pub states: StateCodec,
    /// Session cookie attributes
    pub cookies: CookiePolicy,
    /// Resolved settings
    pub settings: PipelineSettings,
}

/// Create the authentication router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let prefix = state.settings.prefix.clone();

    Router::new()
        .route(&format!("{prefix}{CALLBACK_PATH}"), get(callback_handler))
        .route(&format!("{prefix}{LOGOUT_PATH}"), post(logout_handler))
        .fallback(authenticate_handler)
        .layer(middleware::from_fn_with_state(Arc::clone(&state), readiness_gate))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Hold everything until ready, then let skip-listed paths through.
async fn readiness_gate(State(state): State<Arc<AppState>>, request: Request<Body>, next: Next) -> Response {
    if !state.readiness.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service not ready").into_response();
    }

    let path = request.uri().path();
    if state.settings.is_skipped(path) {
        debug!(path = %path, "Skipping authentication");
        return StatusCode::OK.into_response();
    }

    next.run(request).await
}

/// Authenticate and authorize any request not routed elsewhere.
async fn authenticate_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let (parts, _body) = request.into_parts();

    let response = match state.authenticators.authenticate(&parts).await {
        Ok(Some(response)) => response,
        Ok(None) => {
            debug!(path = %parts.uri.path(), "Unauthenticated request");
            return start_login(&state, &parts).await;
        }
        Err(AuthenticatorError::LoginExpired) => {
            debug!(path = %parts.uri.path(), "Login expired");
            return start_login(&state, &parts).await;
        }
        Err(AuthenticatorError::Rejected(reason)) => {
            warn!(path = %parts.uri.path(), reason = %reason, "Credential rejected");
            return unauthorized();
        }
        Err(e) => {
            error!(path = %parts.uri.path(), error = %e, "Authentication failed");
            return internal_error();
        }
    };

    match state.authorizers.authorize(&parts, &response.user).await {
        Ok(decision) if decision.allowed => {}
        Ok(decision) => {
            info!(
                user = %response.user.name,
                path = %parts.uri.path(),
                reason = %decision.reason,
                "Request denied"
            );
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
        Err(e) => {
            error!(error = %e, "Authorization failed");
            return internal_error();
        }
    }

    match identity_headers(&state.settings, response) {
        Ok(headers) => (StatusCode::OK, headers).into_response(),
        Err(e) => {
            error!(error = %e, "Identity is not representable as headers");
            internal_error()
        }
    }
}

/// Headers telling the upstream who made the request.
fn identity_headers(settings: &PipelineSettings, response: AuthResponse) -> Result<HeaderMap> {
    let AuthResponse { user, mut headers } = response;

    let user_id = format!(
        "{}{}",
        settings.user_id_prefix,
        settings.user_id_transformer.transform(&user.name)
    );
    headers.insert(settings.user_id_header.clone(), header_value(&user_id)?);
    headers.insert(settings.groups_header.clone(), header_value(&user.groups.join(","))?);
    if let Some(name) = &settings.auth_method_header {
        if let Some(method) = user.auth_method() {
            headers.insert(name.clone(), header_value(method)?);
        }
    }
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Internal(format!("invalid header value: {e}")))
}

/// Redirect the browser to the provider, or answer 401 to scripts.
async fn start_login(state: &AppState, parts: &Parts) -> Response {
    if is_xhr(parts) {
        return unauthorized();
    }

    match state.states.issue(parts).await {
        Ok((param, cookie)) => {
            let location = state.manager.authorization_url(&param);
            (CookieJar::new().add(cookie), found(&location)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to store login state");
            internal_error()
        }
    }
}

fn is_xhr(parts: &Parts) -> bool {
    parts
        .headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

/// Provider redirect parameters.
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Finish a login: verify state, exchange the code, and open a session.
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    request: Request<Body>,
) -> Response {
    let (parts, _body) = request.into_parts();

    if let Some(error) = &query.error {
        warn!(
            error = %error,
            description = query.error_description.as_deref().unwrap_or_default(),
            "Provider returned an authorization error"
        );
        return (StatusCode::UNAUTHORIZED, "Login failed").into_response();
    }

    let login_state = match state.states.verify(&parts).await {
        Ok(login_state) => login_state,
        Err(StateError::Store(e)) => {
            error!(error = %e, "Failed to read login state");
            return internal_error();
        }
        Err(e) => {
            warn!(error = %e, "Login state verification failed");
            return (StatusCode::UNAUTHORIZED, "Invalid state").into_response();
        }
    };

    // The attempt is consumed; every answer from here on retires its cookie
    let mut jar = CookieJar::new();
    if let Some(clear) = state.states.clear_cookie(&parts) {
        jar = jar.add(clear);
    }

    let Some(code) = query.code.filter(|c| !c.is_empty()) else {
        warn!("Callback without authorization code");
        return (jar, (StatusCode::BAD_REQUEST, "Missing authorization code")).into_response();
    };

    let session = match establish_session(&state, &code).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Login failed");
            return (jar, internal_error()).into_response();
        }
    };

    let session_id = match state.sessions.create(&session).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "Failed to store session");
            return (jar, internal_error()).into_response();
        }
    };
    info!(user = %session.user_id, groups = ?session.groups, "Login succeeded");

    let jar = jar.add(state.cookies.build(
        state.settings.session_cookie.clone(),
        session_id,
        state.settings.session_max_age,
    ));

    let location = match &state.settings.after_login_url {
        Some(after_login) => with_next(after_login, &login_state.first_visited_url),
        None => login_state.first_visited_url,
    };
    (jar, found(&location)).into_response()
}

/// Exchange `code` and build the session from the verified ID token.
async fn establish_session(state: &AppState, code: &str) -> Result<UserSession> {
    let tokens = state.manager.exchange_code(code).await?;
    let id_token = tokens
        .id_token
        .as_deref()
        .ok_or(crate::session::ProviderError::MissingIdToken)?;
    let claims = state
        .manager
        .verify_id_token(id_token, Some(state.manager.client_id()))
        .await?;

    let user_id = claims
        .string(&state.settings.user_id_claim)
        .ok_or_else(|| {
            Error::Internal(format!(
                "ID token lacks user id claim '{}'",
                state.settings.user_id_claim
            ))
        })?
        .to_string();
    let groups = claims.strings(&state.settings.groups_claim).unwrap_or_default();

    Ok(UserSession::new(user_id, groups, tokens))
}

/// Append `next=<target>` to `url`.
fn with_next(url: &str, target: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("next", target)
        .finish();
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}

/// End the current session.
async fn logout_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let (parts, _body) = request.into_parts();
    let settings = &state.settings;

    let Some(id) = session_id(&parts, &settings.session_cookie, &settings.session_header) else {
        return unauthorized();
    };

    let session = match state.sessions.get(&id).await {
        Ok(Some(session)) => session,
        Ok(None) => return unauthorized(),
        Err(e) => {
            error!(error = %e, "Failed to read session");
            return internal_error();
        }
    };

    if let Err(e) = revoke_session(&state.manager, &state.sessions, &id, &session).await {
        error!(user = %session.user_id, error = %e, "Failed to revoke session");
        return internal_error();
    }

    let jar = CookieJar::new().add(state.cookies.removal(settings.session_cookie.clone()));
    (jar, found(&settings.after_logout_url)).into_response()
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}
