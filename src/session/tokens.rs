//! Token and session record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token endpoint response (RFC 6749 §5.1 plus the OIDC `id_token`).
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// OAuth2 tokens held by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Tokens {
    /// Access token
    pub access_token: String,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Refresh token (optional)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Raw ID token returned alongside the access token
    #[serde(default)]
    pub id_token: Option<String>,

    /// Access token expiration (Unix timestamp)
    #[serde(default)]
    pub expires_at: Option<i64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuth2Tokens {
    pub(crate) fn from_response(response: TokenResponse) -> Self {
        let expires_at = response
            .expires_in
            .map(|secs| Utc::now().timestamp().saturating_add(secs));

        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(default_token_type),
            refresh_token: response.refresh_token,
            id_token: response.id_token,
            expires_at,
        }
    }

    /// Check if the access token has passed its recorded expiry.
    ///
    /// Tokens without an expiry never expire locally.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Utc::now().timestamp() >= expires_at)
    }

    /// Merge a refresh response into these tokens.
    ///
    /// Providers may omit the refresh or ID token on refresh; the previous
    /// values are kept in that case.
    #[must_use]
    pub fn refreshed(self, fresh: Self) -> Self {
        Self {
            access_token: fresh.access_token,
            token_type: fresh.token_type,
            refresh_token: fresh.refresh_token.or(self.refresh_token),
            id_token: fresh.id_token.or(self.id_token),
            expires_at: fresh.expires_at,
        }
    }
}

/// Server-side record of an authenticated browser session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    /// Stable user identity (the configured user-id claim)
    pub user_id: String,

    /// Group memberships captured at login.
    ///
    /// Records written before group capture existed have no such field and
    /// load with an empty set.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Provider tokens
    pub tokens: OAuth2Tokens,

    /// When the session was established
    pub created_at: DateTime<Utc>,
}

impl UserSession {
    /// New session established now.
    #[must_use]
    pub fn new(user_id: String, groups: Vec<String>, tokens: OAuth2Tokens) -> Self {
        Self {
            user_id,
            groups,
            tokens,
            created_at: Utc::now(),
        }
    }
}
