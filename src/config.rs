//! Configuration management

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use axum_extra::extract::cookie::SameSite;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::transformer::{TransformRule, UserIdTransformer};
use crate::{Error, Result};

/// `${VAR}` or `${VAR:-default}`
static ENV_VAR_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok());

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Identity provider client
    pub oidc: OidcConfig,
    /// User session cookie and store
    pub session: SessionConfig,
    /// CSRF login state
    pub state: StateConfig,
    /// Headers exchanged with the proxy and upstreams
    pub headers: HeadersConfig,
    /// Authenticators, consulted in order
    pub authenticators: Vec<AuthenticatorKind>,
    /// Kubernetes token review
    pub kubernetes: KubernetesConfig,
    /// Authorization policy
    pub authz: AuthzConfig,
    /// Page to land on after login; receives the original URL as `next`
    pub after_login_url: Option<String>,
    /// Page to land on after logout
    pub after_logout_url: String,
    /// Rewrites applied to the user id before it is sent upstream
    pub user_id_transformer: Vec<TransformRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            oidc: OidcConfig::default(),
            session: SessionConfig::default(),
            state: StateConfig::default(),
            headers: HeadersConfig::default(),
            authenticators: vec![AuthenticatorKind::Session, AuthenticatorKind::IdToken],
            kubernetes: KubernetesConfig::default(),
            authz: AuthzConfig::default(),
            after_login_url: None,
            after_logout_url: "/".to_string(),
            user_id_transformer: Vec::new(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Authentication listener port
    pub port: u16,
    /// Readiness probe port
    pub readiness_port: u16,
    /// Prefix for the callback and logout endpoints
    pub url_prefix: String,
    /// Path prefixes that bypass authentication
    pub skip_auth_urls: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            readiness_port: 8081,
            url_prefix: "/authservice".to_string(),
            skip_auth_urls: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// URL prefix without a trailing slash (`""` for the root).
    #[must_use]
    pub fn prefix(&self) -> &str {
        self.url_prefix.trim_end_matches('/')
    }
}

/// Identity provider client configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Issuer URL; discovery is fetched from `/.well-known/openid-configuration` under it
    pub provider_url: String,
    /// Overrides the discovered authorization endpoint
    pub auth_url: Option<String>,
    /// Registered client ID
    pub client_id: String,
    /// Client secret; `${VAR}` references are expanded
    #[serde(skip_serializing)]
    pub client_secret: String,
    /// Callback URL registered with the provider
    pub redirect_url: String,
    /// Scopes requested at login
    pub scopes: Vec<String>,
    /// PEM bundle of extra CAs trusted for provider calls
    pub ca_bundle: Option<PathBuf>,
    /// Claim holding the user id
    pub user_id_claim: String,
    /// Claim holding the user's groups
    pub groups_claim: String,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            provider_url: String::new(),
            auth_url: None,
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: String::new(),
            scopes: vec!["openid".to_string(), "email".to_string(), "groups".to_string()],
            ca_bundle: None,
            user_id_claim: "email".to_string(),
            groups_claim: "groups".to_string(),
        }
    }
}

impl fmt::Debug for OidcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcConfig")
            .field("provider_url", &self.provider_url)
            .field("auth_url", &self.auth_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_url", &self.redirect_url)
            .field("scopes", &self.scopes)
            .field("ca_bundle", &self.ca_bundle)
            .field("user_id_claim", &self.user_id_claim)
            .field("groups_claim", &self.groups_claim)
            .finish()
    }
}

/// `SameSite` attribute for cookies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SameSitePolicy {
    /// `Lax`
    #[default]
    #[serde(alias = "lax")]
    Lax,
    /// `Strict`
    #[serde(alias = "strict")]
    Strict,
    /// `None`; cookies are then marked `Secure`
    #[serde(alias = "none")]
    None,
}

impl From<SameSitePolicy> for SameSite {
    fn from(policy: SameSitePolicy) -> Self {
        match policy {
            SameSitePolicy::Lax => Self::Lax,
            SameSitePolicy::Strict => Self::Strict,
            SameSitePolicy::None => Self::None,
        }
    }
}

/// User session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session cookie name
    pub cookie_name: String,
    /// Session lifetime
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// `SameSite` for session and state cookies
    pub same_site: SameSitePolicy,
    /// Cookie domain; enables absolute first-visited URLs
    pub domain: Option<String>,
    /// Header that may carry the session id instead of the cookie
    pub auth_header: String,
    /// Revalidate the access token at the provider on every request
    pub strict_validation: bool,
    /// JSON snapshot file for sessions and state; in-memory only when unset
    pub store_path: Option<PathBuf>,
    /// How often expired records are swept
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "authservice_session".to_string(),
            max_age: Duration::from_secs(24 * 60 * 60),
            same_site: SameSitePolicy::default(),
            domain: None,
            auth_header: "Authorization".to_string(),
            strict_validation: false,
            store_path: None,
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Login state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Suffix the state cookie with a nonce so concurrent logins don't collide
    pub dynamic_cookie_naming: bool,
    /// Scheme recorded when `scheme_header` is absent
    pub scheme_default: String,
    /// Trusted header carrying the original request scheme
    pub scheme_header: Option<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dynamic_cookie_naming: false,
            scheme_default: "https".to_string(),
            scheme_header: Some("X-Forwarded-Proto".to_string()),
        }
    }
}

/// Header names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadersConfig {
    /// Upstream header carrying the user id
    pub user_id_header: String,
    /// Prepended to the user id
    pub user_id_prefix: String,
    /// Upstream header carrying comma-separated groups
    pub groups_header: String,
    /// Upstream header carrying the authentication method, if any
    pub auth_method_header: Option<String>,
    /// Request header holding a bearer ID token
    pub id_token_header: String,
    /// Upstream header the verified ID token is re-emitted on
    pub token_header: String,
    /// Scheme prepended to the re-emitted token; empty for none
    pub token_scheme: String,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            user_id_header: "kubeflow-userid".to_string(),
            user_id_prefix: String::new(),
            groups_header: "kubeflow-groups".to_string(),
            auth_method_header: None,
            id_token_header: "Authorization".to_string(),
            token_header: "Authorization".to_string(),
            token_scheme: "Bearer".to_string(),
        }
    }
}

/// Authenticator selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticatorKind {
    /// Kubernetes service-account token review
    Kubernetes,
    /// Server-side session cookie
    Session,
    /// Bearer OIDC ID token
    #[serde(rename = "idtoken")]
    IdToken,
}

/// Kubernetes token review configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Audiences the token must be valid for; empty means the API server default
    pub audiences: Vec<String>,
}

/// Authorization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    /// Groups allowed through; `*` allows everyone
    pub groups_allowlist: Vec<String>,
    /// Per-host rules file; replaces the allowlist when set
    pub rules_path: Option<PathBuf>,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            groups_allowlist: vec!["*".to_string()],
            rules_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file, overlaid with
    /// `AUTHSERVICE_`-prefixed environment variables (`__` nests).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTHSERVICE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.oidc.client_secret = expand_env_vars(&config.oidc.client_secret);

        Ok(config)
    }

    /// Reject configurations the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.oidc.provider_url.is_empty() {
            return Err(Error::Config("oidc.provider_url is required".to_string()));
        }
        url::Url::parse(&self.oidc.provider_url)
            .map_err(|e| Error::Config(format!("Invalid oidc.provider_url: {e}")))?;
        if self.oidc.client_id.is_empty() {
            return Err(Error::Config("oidc.client_id is required".to_string()));
        }
        if self.oidc.redirect_url.is_empty() {
            return Err(Error::Config("oidc.redirect_url is required".to_string()));
        }
        if self.authenticators.is_empty() {
            return Err(Error::Config("at least one authenticator is required".to_string()));
        }
        if !self.server.url_prefix.is_empty() && !self.server.url_prefix.starts_with('/') {
            return Err(Error::Config(format!(
                "server.url_prefix must start with '/': {}",
                self.server.url_prefix
            )));
        }
        if self.session.cookie_name.is_empty() {
            return Err(Error::Config("session.cookie_name is required".to_string()));
        }
        UserIdTransformer::new(&self.user_id_transformer)?;
        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:-default}` from the process environment.
///
/// Unset variables without a default are left as written.
fn expand_env_vars(value: &str) -> String {
    let Some(re) = ENV_VAR_PATTERN.as_ref() else {
        return value.to_string();
    };
    re.replace_all(value, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            caps.get(2)
                .map_or_else(|| caps[0].to_string(), |d| d.as_str().to_string())
        })
    })
    .into_owned()
}

/// Human-readable `Duration` fields (`"30s"`, `"5m"`, `"24h"`, `"100ms"`).
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize as whole seconds, e.g. `"30s"`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize from a suffixed string or a bare number of seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" before "s" or "m"
        if let Some(ms) = s.strip_suffix("ms") {
            return number(ms, s).map(Duration::from_millis);
        }
        let (digits, unit_secs) = if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        number(digits, s)?
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    }

    fn number(digits: &str, whole: &str) -> Result<u64, String> {
        digits
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{whole}': {e}"))
    }

}
