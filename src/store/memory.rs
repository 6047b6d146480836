//! In-memory store backend with optional JSON file persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{StoreBackend, StoreError, StoredRecord};

/// On-disk snapshot layout: bucket -> id -> record.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    buckets: BTreeMap<String, BTreeMap<String, StoredRecord>>,
}

/// `DashMap`-backed store, optionally mirrored to a file.
pub struct InMemoryBackend {
    records: DashMap<(String, String), StoredRecord>,
    persist_path: Option<PathBuf>,
    /// Serializes snapshot writes so the last write always reflects the
    /// latest map state.
    persist_lock: tokio::sync::Mutex<()>,
}

impl InMemoryBackend {
    /// Volatile backend: records are lost on restart.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            persist_path: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Backend mirrored to `path`.
    ///
    /// An existing snapshot is loaded (expired records are dropped). A
    /// missing file starts empty. An unreadable or malformed file is an
    /// error, since silently discarding sessions would hide operator mistakes.
    pub fn with_persistence(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = DashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = if content.trim().is_empty() {
                Snapshot::default()
            } else {
                serde_json::from_str(&content).map_err(StoreError::Snapshot)?
            };
            for (bucket, entries) in snapshot.buckets {
                for (id, record) in entries {
                    if !record.is_expired() {
                        records.insert((bucket.clone(), id), record);
                    }
                }
            }
            info!(path = %path.display(), records = records.len(), "Loaded session store snapshot");
        } else if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            records,
            persist_path: Some(path),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Number of records currently held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn key(bucket: &str, id: &str) -> (String, String) {
        (bucket.to_string(), id.to_string())
    }

    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for entry in &self.records {
            if entry.value().is_expired() {
                continue;
            }
            let (bucket, id) = entry.key();
            snapshot
                .buckets
                .entry(bucket.clone())
                .or_default()
                .insert(id.clone(), entry.value().clone());
        }
        snapshot
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let content = serde_json::to_vec(&self.snapshot()).map_err(StoreError::Encode)?;
        write_atomically(path, &content).await?;
        debug!(path = %path.display(), "Persisted session store snapshot");
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;

    // Owner read/write only: the snapshot contains provider tokens
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await
        {
            warn!(path = %tmp.display(), error = %e, "Failed to restrict snapshot permissions");
        }
    }

    tokio::fs::rename(&tmp, path).await
}

#[async_trait::async_trait]
impl StoreBackend for InMemoryBackend {
    async fn load(&self, bucket: &str, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let key = Self::key(bucket, id);
        let expired = match self.records.get(&key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value().clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.records.remove_if(&key, |_, record| record.is_expired());
        }
        Ok(None)
    }

    async fn store(&self, bucket: &str, id: &str, record: StoredRecord) -> Result<(), StoreError> {
        self.records.insert(Self::key(bucket, id), record);
        self.persist().await
    }

    async fn update_if_present(
        &self,
        bucket: &str,
        id: &str,
        data: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let updated = match self.records.get_mut(&Self::key(bucket, id)) {
            Some(mut entry) if !entry.is_expired() => {
                entry.data = data;
                true
            }
            _ => false,
        };
        if updated {
            self.persist().await?;
        }
        Ok(updated)
    }

    async fn remove(&self, bucket: &str, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let Some((_, record)) = self.records.remove(&Self::key(bucket, id)) else {
            return Ok(None);
        };
        self.persist().await?;
        Ok((!record.is_expired()).then_some(record))
    }

    async fn reap_expired(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired());
        let reaped = before.saturating_sub(self.records.len());
        if reaped > 0 {
            if let Err(e) = self.persist().await {
                warn!(error = %e, "Failed to persist session store after reaping");
            }
        }
        reaped
    }
}
