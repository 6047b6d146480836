//! CSRF-bound, single-use OIDC login state.
//!
//! `issue` stores a [`State`] record and hands back the value for the
//! provider's `state` parameter plus a cookie binding it to the browser.
//! `verify` accepts the callback only when the parameter matches the cookie
//! and the record is still live, consuming the record so it cannot be
//! replayed.
//!
//! With dynamic cookie naming each login attempt gets its own cookie,
//! `oidc_state_csrf_<nonce>`, and the state parameter becomes
//! `<record id>.<nonce>`, so several tabs can log in concurrently.

use std::time::Duration;

use axum::http::header::HOST;
use axum::http::request::Parts;
use axum::http::HeaderName;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::CookiePolicy;
use crate::store::{SessionStore, StoreError};

/// Base name of the CSRF-state cookie.
pub const STATE_COOKIE_NAME: &str = "oidc_state_csrf";

/// Lifetime of a pending login attempt.
pub const STATE_TTL: Duration = Duration::from_secs(20 * 60);

const NONCE_LEN: usize = 8;

/// A pending login attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Where to send the user once login completes
    pub first_visited_url: String,
}

/// Why a callback's state was rejected.
///
/// Callers must collapse all variants into one generic client-facing
/// message; the detail is for server logs only.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The callback carried no `state` parameter.
    #[error("state parameter missing")]
    MissingParameter,

    /// The browser did not present the expected state cookie.
    #[error("state cookie missing")]
    MissingCookie,

    /// Parameter and cookie disagree (CSRF).
    #[error("state parameter does not match cookie")]
    Mismatch,

    /// No live record exists (expired, already used, or never issued).
    #[error("state expired or already used")]
    Expired,

    /// The state record could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How the first visited URL is recorded.
#[derive(Debug, Clone)]
pub enum UrlStrategy {
    /// Path and query only.
    Relative,
    /// Absolute `scheme://host/path?query`, for logins that cross subdomains.
    SchemeAndHost {
        /// Configured cookie domain the host is expected to fall under
        session_domain: String,
        /// Scheme used when `scheme_header` is absent
        default_scheme: String,
        /// Trusted header carrying the original scheme, e.g. `X-Forwarded-Proto`
        scheme_header: Option<HeaderName>,
    },
}

impl UrlStrategy {
    /// URL the request was trying to reach.
    #[must_use]
    pub fn first_visited_url(&self, parts: &Parts) -> String {
        let path = local_path(parts.uri.path_and_query().map_or("/", |pq| pq.as_str()));
        match self {
            Self::Relative => path,
            Self::SchemeAndHost {
                session_domain,
                default_scheme,
                scheme_header,
            } => {
                let scheme = scheme_header
                    .as_ref()
                    .and_then(|name| parts.headers.get(name))
                    .and_then(|v| v.to_str().ok())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(default_scheme);
                let host = request_host(parts).unwrap_or_default();
                let bare_host = host.split(':').next().unwrap_or(host);
                if !within_domain(bare_host, session_domain) {
                    warn!(
                        host = %host,
                        session_domain = %session_domain,
                        "Request host is outside the session domain; session cookie will not be sent to it"
                    );
                }
                format!("{scheme}://{host}{path}")
            }
        }
    }
}

/// Collapse leading slashes and backslashes to one `/`.
///
/// `//host/path` and `/\host/path` are protocol-relative to a browser, so
/// redirecting to them would leave the site.
fn local_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches(['/', '\\']))
}

/// Whether `host` is `domain` or one of its subdomains.
fn within_domain(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|label| label.ends_with('.'))
}

/// Host the request was addressed to.
pub(crate) fn request_host(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host())
}

/// Issues and verifies login state.
pub struct StateCodec {
    store: SessionStore<State>,
    cookies: CookiePolicy,
    strategy: UrlStrategy,
    dynamic_naming: bool,
}

impl StateCodec {
    /// Codec persisting state in `store`.
    #[must_use]
    pub fn new(
        store: SessionStore<State>,
        cookies: CookiePolicy,
        strategy: UrlStrategy,
        dynamic_naming: bool,
    ) -> Self {
        Self {
            store,
            cookies,
            strategy,
            dynamic_naming,
        }
    }

    /// Start a login attempt for the request in `parts`.
    ///
    /// Returns the provider `state` parameter and the cookie to set.
    pub async fn issue(&self, parts: &Parts) -> Result<(String, Cookie<'static>), StoreError> {
        let state = State {
            first_visited_url: self.strategy.first_visited_url(parts),
        };
        let id = self.store.create(&state).await?;

        let (cookie_name, param) = if self.dynamic_naming {
            let nonce = generate_nonce();
            (format!("{STATE_COOKIE_NAME}_{nonce}"), format!("{id}.{nonce}"))
        } else {
            (STATE_COOKIE_NAME.to_string(), id.clone())
        };

        debug!(cookie = %cookie_name, url = %state.first_visited_url, "Issued login state");
        let cookie = self.cookies.build(cookie_name, id, self.store.ttl());
        Ok((param, cookie))
    }

    /// Verify the callback request in `parts` and consume its state.
    pub async fn verify(&self, parts: &Parts) -> Result<State, StateError> {
        let param = state_param(parts).ok_or(StateError::MissingParameter)?;
        self.verify_param(&param, &CookieJar::from_headers(&parts.headers))
            .await
    }

    /// Verify a `state` value against the cookies in `jar`.
    pub async fn verify_param(&self, param: &str, jar: &CookieJar) -> Result<State, StateError> {
        let (id, cookie_name) = self.split_param(param).ok_or(StateError::Mismatch)?;
        let cookie = jar.get(&cookie_name).ok_or(StateError::MissingCookie)?;
        let cookie_id = cookie.value();

        if !bool::from(cookie_id.as_bytes().ct_eq(id.as_bytes())) {
            // The browser's own attempt is burned too; it must start over
            if let Err(e) = self.store.delete(cookie_id).await {
                debug!(error = %e, "Failed to discard state after mismatch");
            }
            return Err(StateError::Mismatch);
        }

        self.store.take(id).await?.ok_or(StateError::Expired)
    }

    /// Cookie clearing the state cookie named by the callback's parameter.
    #[must_use]
    pub fn clear_cookie(&self, parts: &Parts) -> Option<Cookie<'static>> {
        let param = state_param(parts)?;
        let (_, cookie_name) = self.split_param(&param)?;
        Some(self.cookies.removal(cookie_name))
    }

    /// Split a parameter into record id and cookie name.
    fn split_param<'a>(&self, param: &'a str) -> Option<(&'a str, String)> {
        if !self.dynamic_naming {
            return Some((param, STATE_COOKIE_NAME.to_string()));
        }
        let (id, nonce) = param.rsplit_once('.')?;
        let valid_nonce =
            nonce.len() == NONCE_LEN && nonce.bytes().all(|b| b.is_ascii_lowercase());
        valid_nonce.then(|| (id, format!("{STATE_COOKIE_NAME}_{nonce}")))
    }
}

/// `state` query parameter of a request.
fn state_param(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Random lowercase suffix for per-attempt cookie names.
fn generate_nonce() -> String {
    let bytes: [u8; NONCE_LEN] = rand::random();
    bytes.iter().map(|b| char::from(b'a' + b % 26)).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::Request;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::{InMemoryBackend, OIDC_STATE_BUCKET};

    fn codec(dynamic_naming: bool, strategy: UrlStrategy) -> StateCodec {
        let store = SessionStore::new(Arc::new(InMemoryBackend::new()), OIDC_STATE_BUCKET, STATE_TTL);
        StateCodec::new(store, CookiePolicy::default(), strategy, dynamic_naming)
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn callback(param: &str, cookie: &Cookie<'_>) -> Parts {
        let cookie_header = format!("{}={}", cookie.name(), cookie.value());
        request(
            &format!("/oidc/callback?state={param}&code=c"),
            &[("cookie", cookie_header.as_str())],
        )
    }

    #[tokio::test]
    async fn issue_then_verify_recovers_first_visited_url() {
        // GIVEN: a login attempt started from /app/page?x=1
        let codec = codec(false, UrlStrategy::Relative);
        let (param, cookie) = codec.issue(&request("/app/page?x=1", &[])).await.unwrap();
        assert_eq!(cookie.name(), STATE_COOKIE_NAME);
        assert_eq!(param, cookie.value());

        // WHEN: the callback arrives with matching parameter and cookie
        let state = codec.verify(&callback(&param, &cookie)).await.unwrap();

        // THEN: the original URL is recovered
        assert_eq!(state.first_visited_url, "/app/page?x=1");
    }

    #[tokio::test]
    async fn state_is_single_use() {
        let codec = codec(false, UrlStrategy::Relative);
        let (param, cookie) = codec.issue(&request("/", &[])).await.unwrap();

        assert!(codec.verify(&callback(&param, &cookie)).await.is_ok());
        assert!(matches!(
            codec.verify(&callback(&param, &cookie)).await,
            Err(StateError::Expired)
        ));
    }

    #[tokio::test]
    async fn concurrent_verifies_succeed_at_most_once() {
        let codec = Arc::new(codec(false, UrlStrategy::Relative));
        let (param, cookie) = codec.issue(&request("/", &[])).await.unwrap();
        let jar = CookieJar::new().add(cookie);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let codec = codec.clone();
                let param = param.clone();
                let jar = jar.clone();
                tokio::spawn(async move { codec.verify_param(&param, &jar).await.is_ok() })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn parameter_cookie_mismatch_is_rejected() {
        // GIVEN: two separate login attempts
        let codec = codec(false, UrlStrategy::Relative);
        let (param_a, _) = codec.issue(&request("/a", &[])).await.unwrap();
        let (_, cookie_b) = codec.issue(&request("/b", &[])).await.unwrap();

        // WHEN: the parameter of one arrives with the cookie of the other
        let result = codec.verify(&callback(&param_a, &cookie_b)).await;

        // THEN: CSRF mismatch
        assert!(matches!(result, Err(StateError::Mismatch)));
    }

    #[tokio::test]
    async fn mismatch_burns_the_browsers_attempt() {
        let codec = codec(false, UrlStrategy::Relative);
        let (param, cookie) = codec.issue(&request("/", &[])).await.unwrap();

        let forged = codec.verify(&callback("forged", &cookie)).await;
        assert!(matches!(forged, Err(StateError::Mismatch)));

        assert!(matches!(
            codec.verify(&callback(&param, &cookie)).await,
            Err(StateError::Expired)
        ));
    }

    #[tokio::test]
    async fn missing_parameter_and_cookie_are_distinguished() {
        let codec = codec(false, UrlStrategy::Relative);
        let (param, _) = codec.issue(&request("/", &[])).await.unwrap();

        assert!(matches!(
            codec.verify(&request("/oidc/callback?code=c", &[])).await,
            Err(StateError::MissingParameter)
        ));
        assert!(matches!(
            codec
                .verify(&request(&format!("/oidc/callback?state={param}"), &[]))
                .await,
            Err(StateError::MissingCookie)
        ));
    }

    #[tokio::test]
    async fn dynamic_naming_allows_concurrent_attempts() {
        // GIVEN: two tabs starting logins with dynamic cookie names
        let codec = codec(true, UrlStrategy::Relative);
        let (param_1, cookie_1) = codec.issue(&request("/one", &[])).await.unwrap();
        let (param_2, cookie_2) = codec.issue(&request("/two", &[])).await.unwrap();

        // THEN: cookie names differ and parameters carry the nonce
        assert_ne!(cookie_1.name(), cookie_2.name());
        assert!(cookie_1.name().starts_with("oidc_state_csrf_"));
        let nonce = param_1.rsplit_once('.').unwrap().1;
        assert_eq!(cookie_1.name(), format!("oidc_state_csrf_{nonce}"));

        // WHEN: both callbacks arrive with both cookies present
        let both = format!(
            "{}={}; {}={}",
            cookie_1.name(),
            cookie_1.value(),
            cookie_2.name(),
            cookie_2.value()
        );
        let second = codec
            .verify(&request(&format!("/oidc/callback?state={param_2}"), &[("cookie", &both)]))
            .await
            .unwrap();
        let first = codec
            .verify(&request(&format!("/oidc/callback?state={param_1}"), &[("cookie", &both)]))
            .await
            .unwrap();

        // THEN: each resolves to its own attempt
        assert_eq!(first.first_visited_url, "/one");
        assert_eq!(second.first_visited_url, "/two");
    }

    #[tokio::test]
    async fn dynamic_parameter_without_nonce_is_mismatch() {
        let codec = codec(true, UrlStrategy::Relative);
        let (_, cookie) = codec.issue(&request("/", &[])).await.unwrap();
        assert!(matches!(
            codec.verify(&callback("no-nonce-here", &cookie)).await,
            Err(StateError::Mismatch)
        ));
    }

    #[tokio::test]
    async fn clear_cookie_targets_the_attempts_cookie() {
        let codec = codec(true, UrlStrategy::Relative);
        let (param, cookie) = codec.issue(&request("/", &[])).await.unwrap();

        let removal = codec.clear_cookie(&callback(&param, &cookie)).unwrap();

        assert_eq!(removal.name(), cookie.name());
        assert_eq!(removal.max_age(), Some(time::Duration::ZERO));
    }

    #[test]
    fn scheme_and_host_strategy_uses_header_then_default() {
        let strategy = UrlStrategy::SchemeAndHost {
            session_domain: ".example.com".to_string(),
            default_scheme: "https".to_string(),
            scheme_header: Some(HeaderName::from_static("x-forwarded-proto")),
        };

        let forwarded = request(
            "/app?x=1",
            &[("host", "app.example.com"), ("x-forwarded-proto", "http")],
        );
        assert_eq!(
            strategy.first_visited_url(&forwarded),
            "http://app.example.com/app?x=1"
        );

        let plain = request("/app", &[("host", "app.example.com")]);
        assert_eq!(strategy.first_visited_url(&plain), "https://app.example.com/app");
    }

    #[tokio::test]
    async fn protocol_relative_path_is_kept_on_site() {
        // GIVEN: a login started from a path a browser would treat as another host
        let codec = codec(false, UrlStrategy::Relative);
        let (param, cookie) = codec
            .issue(&request("//evil.example.net/phish?x=1", &[]))
            .await
            .unwrap();

        // WHEN: the callback recovers it
        let state = codec.verify(&callback(&param, &cookie)).await.unwrap();

        // THEN: it is a path on this site
        assert_eq!(state.first_visited_url, "/evil.example.net/phish?x=1");
    }

    #[test]
    fn leading_separator_runs_collapse_to_one_slash() {
        assert_eq!(local_path("/"), "/");
        assert_eq!(local_path("/app?x=1"), "/app?x=1");
        assert_eq!(local_path("///evil.example.net"), "/evil.example.net");
        assert_eq!(local_path("/\\evil.example.net"), "/evil.example.net");
        assert_eq!(local_path("/a//b"), "/a//b");
    }

    #[test]
    fn scheme_and_host_strategy_collapses_leading_slashes() {
        let strategy = UrlStrategy::SchemeAndHost {
            session_domain: "example.com".to_string(),
            default_scheme: "https".to_string(),
            scheme_header: None,
        };
        let parts = request("//evil.example.net/x", &[("host", "app.example.com")]);
        assert_eq!(
            strategy.first_visited_url(&parts),
            "https://app.example.com/evil.example.net/x"
        );
    }

    #[test]
    fn domain_match_respects_label_boundaries() {
        assert!(within_domain("example.com", ".example.com"));
        assert!(within_domain("app.example.com", "example.com"));
        assert!(within_domain("App.Example.COM", ".example.com"));
        assert!(!within_domain("evilexample.com", "example.com"));
        assert!(!within_domain("example.com.evil.net", "example.com"));
    }

    #[test]
    fn nonce_is_eight_lowercase_letters() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert!(nonce.bytes().all(|b| b.is_ascii_lowercase()));
    }
}
