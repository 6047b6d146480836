//! OIDC login state, provider interaction, and session records.

pub mod manager;
pub mod provider;
pub mod state;
pub mod tokens;

use axum_extra::extract::cookie::{Cookie, SameSite};

pub use manager::{OidcSessionManager, SessionManager, revoke_session};
pub use provider::{Claims, ProviderError, ProviderMetadata};
pub use state::{State, StateCodec, StateError, UrlStrategy};
pub use tokens::{OAuth2Tokens, UserSession};

/// Attributes shared by the session and CSRF-state cookies.
#[derive(Debug, Clone)]
pub struct CookiePolicy {
    /// `SameSite` attribute
    pub same_site: SameSite,
    /// `Domain` attribute; host-only when unset
    pub domain: Option<String>,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        Self {
            same_site: SameSite::Lax,
            domain: None,
        }
    }
}

impl CookiePolicy {
    /// `HttpOnly` cookie at path `/` living for `max_age`.
    #[must_use]
    pub fn build(&self, name: String, value: String, max_age: std::time::Duration) -> Cookie<'static> {
        let max_age = time::Duration::seconds(i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX));
        let mut builder = Cookie::build((name, value))
            .http_only(true)
            .path("/")
            .same_site(self.same_site)
            .max_age(max_age);
        // Browsers drop SameSite=None cookies that are not Secure
        if self.same_site == SameSite::None {
            builder = builder.secure(true);
        }
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Cookie that makes the browser discard `name`.
    #[must_use]
    pub fn removal(&self, name: String) -> Cookie<'static> {
        self.build(name, String::new(), std::time::Duration::ZERO)
    }
}
