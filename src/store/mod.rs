//! Session store: keyed, TTL-bounded persistence for opaque session records.
//!
//! The [`StoreBackend`] trait abstracts over the engine holding the records.
//! The only current implementation is [`InMemoryBackend`], a `DashMap` that
//! can optionally snapshot itself to a JSON file so sessions survive a
//! restart.
//!
//! A single backend is shared by several [`SessionStore`] views. Each view is
//! bound to a bucket name and a TTL, so long-lived user sessions and
//! short-lived OIDC state records live side by side with independent expiry.
//!
//! # Expiry
//!
//! Expiry is lazy: a record whose deadline has passed is evicted on the read
//! that finds it and reported as absent. [`spawn_reaper`] additionally sweeps
//! the backend periodically so abandoned records do not accumulate.

mod memory;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

pub use memory::InMemoryBackend;

/// Bucket holding authenticated user sessions.
pub const USER_SESSION_BUCKET: &str = "sessions";

/// Bucket holding pending OIDC login state.
pub const OIDC_STATE_BUCKET: &str = "oidc_state";

/// Session store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A stored record could not be decoded into the expected type.
    #[error("corrupt record in bucket '{bucket}': {source}")]
    Decode {
        /// Bucket the record was read from.
        bucket: String,
        /// Underlying decode failure.
        source: serde_json::Error,
    },

    /// A record could not be encoded for storage.
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    /// The persistence file could not be read or written.
    #[error("session store persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    /// The persistence file exists but is not a valid snapshot.
    #[error("session store snapshot is invalid: {0}")]
    Snapshot(#[source] serde_json::Error),
}

/// A record as held by the backend: the encoded value plus its deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    /// JSON-encoded record body.
    pub data: serde_json::Value,
    /// Absolute expiry (Unix epoch seconds).
    pub expires_at: i64,
}

impl StoredRecord {
    /// Returns `true` once the record's deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }
}

/// Storage engine shared by all [`SessionStore`] views.
///
/// Implementations own all locking; callers never add their own.
#[async_trait::async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Fetch a live record. Expired records are evicted and reported as `None`.
    async fn load(&self, bucket: &str, id: &str) -> Result<Option<StoredRecord>, StoreError>;

    /// Insert or overwrite a record.
    async fn store(&self, bucket: &str, id: &str, record: StoredRecord) -> Result<(), StoreError>;

    /// Replace the body of a live record, keeping its deadline.
    ///
    /// Returns `false` without writing when the record is absent or expired.
    /// The check and the write are one atomic step, so a concurrent
    /// [`remove`](Self::remove) is never undone.
    async fn update_if_present(
        &self,
        bucket: &str,
        id: &str,
        data: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Remove a record, returning it if it existed and had not expired.
    ///
    /// Removal is atomic: of two concurrent calls for the same id, at most
    /// one observes the record.
    async fn remove(&self, bucket: &str, id: &str) -> Result<Option<StoredRecord>, StoreError>;

    /// Evict every expired record. Returns how many were removed.
    async fn reap_expired(&self) -> usize;
}

/// Typed view over one bucket of a [`StoreBackend`].
pub struct SessionStore<T> {
    backend: Arc<dyn StoreBackend>,
    bucket: &'static str,
    ttl: Duration,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for SessionStore<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            bucket: self.bucket,
            ttl: self.ttl,
            _record: PhantomData,
        }
    }
}

impl<T> SessionStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Bind a bucket of `backend` with the given record lifetime.
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, bucket: &'static str, ttl: Duration) -> Self {
        Self {
            backend,
            bucket,
            ttl,
            _record: PhantomData,
        }
    }

    /// Lifetime given to newly created records.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Bucket name this view is bound to.
    #[must_use]
    pub fn bucket(&self) -> &'static str {
        self.bucket
    }

    /// Persist `record` under a fresh random identifier and return it.
    pub async fn create(&self, record: &T) -> Result<String, StoreError> {
        let id = generate_session_id();
        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let stored = StoredRecord {
            data: serde_json::to_value(record).map_err(StoreError::Encode)?,
            expires_at: Utc::now().timestamp().saturating_add(ttl_secs),
        };
        self.backend.store(self.bucket, &id, stored).await?;
        debug!(bucket = self.bucket, "Created session record");
        Ok(id)
    }

    /// Look up a record.
    ///
    /// `Ok(None)` means "no such session" (never created, expired, or
    /// deleted). It is not an error, and callers must not authenticate on it.
    pub async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.backend.load(self.bucket, id).await? {
            Some(stored) => self.decode(stored).map(Some),
            None => Ok(None),
        }
    }

    /// Overwrite an existing record, keeping its original deadline.
    ///
    /// Returns `false` if the record was deleted or expired in the meantime;
    /// it is not recreated.
    pub async fn save(&self, id: &str, record: &T) -> Result<bool, StoreError> {
        let data = serde_json::to_value(record).map_err(StoreError::Encode)?;
        self.backend.update_if_present(self.bucket, id, data).await
    }

    /// Delete a record. Returns `true` if a live record was removed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.backend.remove(self.bucket, id).await?.is_some())
    }

    /// Remove and return a record in one step.
    ///
    /// Used for single-use records: concurrent callers cannot both obtain it.
    pub async fn take(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.backend.remove(self.bucket, id).await? {
            Some(stored) => self.decode(stored).map(Some),
            None => Ok(None),
        }
    }

    fn decode(&self, stored: StoredRecord) -> Result<T, StoreError> {
        serde_json::from_value(stored.data).map_err(|source| StoreError::Decode {
            bucket: self.bucket.to_string(),
            source,
        })
    }
}

/// Generate a cryptographically random session identifier.
///
/// 256 bits of entropy, URL-safe base64 without padding (43 characters), so
/// the value is safe in cookies, headers, and query strings alike.
#[must_use]
pub fn generate_session_id() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Spawn a background task that reaps expired records every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    backend: Arc<dyn StoreBackend>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = backend.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired session records");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    });
}
