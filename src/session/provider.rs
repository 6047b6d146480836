//! OIDC provider plumbing: discovery, TLS trust, JWKS caching, ID token verification.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the provider's JWKS (cached for 1 hour; refreshed on unknown `kid`
//!    at most once a minute).
//! 3. Verify the signature plus `iss` and `exp` (60 second clock leeway).
//! 4. Check `aud` against the expected client ID, unless the caller defers it.

use std::path::Path;
use std::time::{Duration, Instant};

use backon::{ConstantBuilder, Retryable};
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Delay between provider discovery attempts at startup.
pub const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Minimum spacing of JWKS refreshes triggered by an unknown `kid`.
pub const JWKS_FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Identity provider and transport failures.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Network-level failure talking to the provider.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-2xx status.
    #[error("provider returned HTTP {status}: {body}")]
    Request {
        /// HTTP status code received.
        status: u16,
        /// Response body, for server-side logging only.
        body: String,
    },

    /// ID token failed signature or claim validation.
    #[error("ID token verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the provider's JWKS.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The token response did not include an ID token.
    #[error("token response contained no id_token")]
    MissingIdToken,

    /// The provider does not advertise an endpoint this operation needs.
    #[error("provider does not support {0}")]
    Unsupported(&'static str),

    /// The custom CA bundle could not be loaded.
    #[error("invalid CA bundle: {0}")]
    Tls(String),
}

impl ProviderError {
    /// HTTP status received from the provider, if it answered at all.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// OpenID Provider metadata (OIDC Discovery 1.0 §3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier; must match the `iss` claim of ID tokens
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// JWKS URL
    pub jwks_uri: String,

    /// UserInfo endpoint (optional)
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// Token revocation endpoint, RFC 7009 (optional)
    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    /// Supported scopes
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Fetch `/.well-known/openid-configuration` below `provider_url`.
    pub async fn discover(client: &Client, provider_url: &str) -> Result<Self, ProviderError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            provider_url.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering OIDC provider metadata");

        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request { status, body });
        }

        let metadata: Self = response.json().await?;
        debug!(issuer = %metadata.issuer, "Discovered OIDC provider");
        Ok(metadata)
    }

    /// Discover, retrying every `delay` until the provider answers.
    ///
    /// Nothing authenticated can be served without the provider, so this
    /// never gives up.
    pub async fn discover_with_retry(client: &Client, provider_url: &str, delay: Duration) -> Self {
        loop {
            let backoff = ConstantBuilder::default()
                .with_delay(delay)
                .without_max_times();

            let result = (|| Self::discover(client, provider_url))
                .retry(backoff)
                .notify(|err: &ProviderError, after: Duration| {
                    warn!(provider = %provider_url, error = %err, retry_in = ?after, "OIDC provider discovery failed");
                })
                .await;

            match result {
                Ok(metadata) => {
                    info!(issuer = %metadata.issuer, "OIDC provider discovered");
                    return metadata;
                }
                Err(e) => warn!(error = %e, "Discovery retry policy exhausted, restarting"),
            }
        }
    }
}

/// Build the HTTP client used for every provider call.
///
/// When `ca_bundle` is set, its PEM certificates are trusted in addition to
/// the built-in roots.
pub fn build_http_client(ca_bundle: Option<&Path>) -> Result<Client, ProviderError> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10));

    if let Some(path) = ca_bundle {
        let pem = std::fs::read(path)
            .map_err(|e| ProviderError::Tls(format!("{}: {e}", path.display())))?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem)
            .map_err(|e| ProviderError::Tls(format!("{}: {e}", path.display())))?;
        if certs.is_empty() {
            return Err(ProviderError::Tls(format!(
                "{}: no certificates found",
                path.display()
            )));
        }
        info!(path = %path.display(), count = certs.len(), "Trusting custom CA bundle");
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    Ok(builder.build()?)
}

/// Claims from a verified ID token or a UserInfo response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(serde_json::Map<String, serde_json::Value>);

impl Claims {
    /// String claim, if present and a string.
    #[must_use]
    pub fn string(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(serde_json::Value::as_str)
    }

    /// String-list claim.
    ///
    /// A single string is accepted as a one-element list; non-string members
    /// are skipped.
    #[must_use]
    pub fn strings(&self, name: &str) -> Option<Vec<String>> {
        match self.0.get(name)? {
            serde_json::Value::String(s) => Some(vec![s.clone()]),
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Raw claim value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Claims {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// ID token verifier for a single issuer.
pub struct IdTokenVerifier {
    issuer: String,
    jwks_uri: String,
    http: Client,
    cache: RwLock<Option<CachedJwks>>,
    /// How long to cache a fetched JWKS (default 1 hour).
    ttl: Duration,
    /// When an unknown `kid` last forced a refresh.
    last_forced_refresh: Mutex<Option<Instant>>,
}

impl IdTokenVerifier {
    /// Verifier fetching keys from `jwks_uri` on demand.
    #[must_use]
    pub fn new(issuer: String, jwks_uri: String, http: Client) -> Self {
        Self {
            issuer,
            jwks_uri,
            http,
            cache: RwLock::new(None),
            ttl: Duration::from_secs(3600),
            last_forced_refresh: Mutex::new(None),
        }
    }

    /// Verifier pre-seeded with a key set.
    #[must_use]
    pub fn with_keys(issuer: String, jwks_uri: String, http: Client, keys: JwkSet) -> Self {
        let verifier = Self::new(issuer, jwks_uri, http);
        *verifier.cache.write() = Some(CachedJwks {
            keys,
            fetched_at: Instant::now(),
        });
        verifier
    }

    /// Verify `raw` and return its claims.
    ///
    /// With `audience = None` the `aud` claim is not checked, so tokens
    /// minted for any client of this issuer are accepted.
    pub async fn verify(&self, raw: &str, audience: Option<&str>) -> Result<Claims, ProviderError> {
        let header = jsonwebtoken::decode_header(raw)?;
        let kid = header.kid.clone().ok_or(ProviderError::MissingKeyId)?;
        let decoding_key = self.find_decoding_key(&kid).await?;

        let mut validation = build_validation(&header);
        validation.set_issuer(&[&self.issuer]);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let token: TokenData<Claims> = jsonwebtoken::decode(raw, &decoding_key, &validation)?;
        Ok(token.claims)
    }

    /// Find a decoding key by `kid`, refreshing the JWKS cache if not found.
    async fn find_decoding_key(&self, kid: &str) -> Result<DecodingKey, ProviderError> {
        let jwks = self.keys(false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        if !self.claim_forced_refresh() {
            debug!(kid = %kid, "Key not found in cached JWKS, refresh rate-limited");
            return Err(ProviderError::UnknownKeyId(kid.to_string()));
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.keys(true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| ProviderError::UnknownKeyId(kid.to_string()))
    }

    /// Reserve the next forced refresh, unless one ran too recently.
    fn claim_forced_refresh(&self) -> bool {
        let mut last = self.last_forced_refresh.lock();
        if last.is_some_and(|at| at.elapsed() < JWKS_FORCED_REFRESH_INTERVAL) {
            return false;
        }
        *last = Some(Instant::now());
        true
    }

    async fn keys(&self, force_refresh: bool) -> Result<JwkSet, ProviderError> {
        if !force_refresh {
            let fresh = self
                .cache
                .read()
                .as_ref()
                .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
                .map(|cached| cached.keys.clone());
            if let Some(keys) = fresh {
                return Ok(keys);
            }
        }

        debug!(issuer = %self.issuer, "Fetching JWKS from {}", self.jwks_uri);
        let response = self.http.get(&self.jwks_uri).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request { status, body });
        }
        let jwks: JwkSet = response.json().await?;

        *self.cache.write() = Some(CachedJwks {
            keys: jwks.clone(),
            fetched_at: Instant::now(),
        });
        Ok(jwks)
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y).ok(),
        // Symmetric keys are never published by a provider for ID tokens
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}

/// Build a [`Validation`] from the JWT header algorithm.
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::PS256 => Algorithm::PS256,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60;
    v
}
