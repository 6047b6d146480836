//! Per-host group rules loaded from a YAML file and hot-reloaded on change.
//!
//! ```yaml
//! rules:
//!   app.example.com:
//!     groups: [eng, ops]
//!   public.example.com:
//!     groups: ["*"]
//! ```
//!
//! The live [`RuleTable`] sits behind an `Arc` that is swapped whole on
//! reload. A request clones the `Arc` once and evaluates against that
//! snapshot, so it sees either the old table or the new one, never a mix.
//! A reload that fails to read or parse leaves the current table in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::request::Parts;
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Authorizer, AuthorizerError, Decision, groups_permitted};
use crate::authn::User;
use crate::session::state::request_host;

/// Quiet period after the last file event before reloading.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Allowed groups for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRule {
    /// Groups allowed to reach the host; `*` allows everyone
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Host to allowed-groups mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTable {
    /// Rules keyed by exact host
    #[serde(default)]
    pub rules: HashMap<String, HostRule>,
}

impl RuleTable {
    /// Parse a rules document.
    pub fn parse(content: &str) -> Result<Self, AuthorizerError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read and parse a rules file.
    pub fn load(path: &Path) -> Result<Self, AuthorizerError> {
        let content = std::fs::read_to_string(path).map_err(|source| AuthorizerError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Decide for a request to `host` by `user`.
    #[must_use]
    pub fn decide(&self, host: &str, user: &User) -> Decision {
        let Some(rule) = self.rules.get(host) else {
            return Decision::deny("host not configured");
        };
        if groups_permitted(&rule.groups, &user.groups) {
            Decision::allow()
        } else {
            Decision::deny(format!(
                "user '{}' groups [{}] not allowed for host '{host}'",
                user.name,
                user.groups.join(", ")
            ))
        }
    }
}

/// Authorizer backed by a hot-reloadable [`RuleTable`].
pub struct ConfigAuthorizer {
    path: PathBuf,
    table: RwLock<Arc<RuleTable>>,
}

impl ConfigAuthorizer {
    /// Load rules from `path`. Failure here is fatal to startup.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, AuthorizerError> {
        let path = path.into();
        let table = RuleTable::load(&path)?;
        info!(path = %path.display(), hosts = table.rules.len(), "Loaded authorization rules");
        Ok(Self {
            path,
            table: RwLock::new(Arc::new(table)),
        })
    }

    /// Rules file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current rule table snapshot.
    #[must_use]
    pub fn table(&self) -> Arc<RuleTable> {
        Arc::clone(&self.table.read())
    }

    /// Re-read the rules file and swap it in.
    ///
    /// The file is read and parsed before the lock is taken; on error the
    /// current table is kept.
    pub async fn reload(&self) -> Result<(), AuthorizerError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AuthorizerError::Read {
                path: self.path.display().to_string(),
                source,
            })?;
        let table = RuleTable::parse(&content)?;
        let hosts = table.rules.len();
        *self.table.write() = Arc::new(table);
        info!(path = %self.path.display(), hosts, "Authorization rules reloaded");
        Ok(())
    }
}

#[async_trait]
impl Authorizer for ConfigAuthorizer {
    fn name(&self) -> &'static str {
        "config"
    }

    async fn authorize(&self, parts: &Parts, user: &User) -> Result<Decision, AuthorizerError> {
        let host = request_host(parts).unwrap_or_default();
        Ok(self.table().decide(host, user))
    }
}

/// What a file event means for the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileChange {
    /// Contents may have changed.
    Modified,
    /// The watched inode is gone; the watch must be re-established.
    Removed,
}

fn classify(kind: &EventKind) -> Option<FileChange> {
    match kind {
        // Permission and timestamp changes
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => None,
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) => Some(FileChange::Removed),
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            Some(FileChange::Modified)
        }
    }
}

/// Watches the rules file and reloads a [`ConfigAuthorizer`] on change.
pub struct RulesWatcher {
    /// Kept alive to prevent the OS watcher from being dropped.
    _watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl RulesWatcher {
    /// Start watching `authorizer`'s rules file.
    ///
    /// Spawns a debounced background task; it exits when `shutdown_rx` fires.
    pub fn start(
        authorizer: Arc<ConfigAuthorizer>,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self, AuthorizerError> {
        let (event_tx, event_rx) = mpsc::channel(32);

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    debug!(paths = ?event.paths, kind = ?event.kind, "Rules file event");
                    if let Some(change) = classify(&event.kind) {
                        // Non-blocking send; a full channel already has a reload queued
                        let _ = event_tx.try_send(change);
                    }
                }
                Err(e) => error!(error = %e, "Rules file watcher error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(authorizer.path(), RecursiveMode::NonRecursive)?;
        info!(path = %authorizer.path().display(), "Watching authorization rules");

        let watcher = Arc::new(Mutex::new(Some(watcher)));
        Self::spawn_reload_task(authorizer, Arc::clone(&watcher), event_rx, shutdown_rx);

        Ok(Self { _watcher: watcher })
    }

    fn spawn_reload_task(
        authorizer: Arc<ConfigAuthorizer>,
        watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
        mut event_rx: mpsc::Receiver<FileChange>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let mut last_event: Option<Instant> = None;
            let mut rearm = false;
            let mut rearm_failures = 0u32;
            let mut interval = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(change) = event_rx.recv() => {
                        if change == FileChange::Removed {
                            rearm = true;
                        }
                        last_event = Some(Instant::now());
                    }
                    _ = interval.tick() => {
                        if rearm {
                            match rewatch(&watcher, authorizer.path()) {
                                Ok(()) => {
                                    info!(path = %authorizer.path().display(), "Re-established rules file watch");
                                    rearm = false;
                                    rearm_failures = 0;
                                    // Give the writer a quiet period before reading
                                    last_event = Some(Instant::now());
                                }
                                Err(e) => {
                                    // The file may not be back yet; keep trying
                                    if rearm_failures == 0 {
                                        warn!(path = %authorizer.path().display(), error = %e, "Failed to re-add rules file watch");
                                    }
                                    rearm_failures = rearm_failures.saturating_add(1);
                                    continue;
                                }
                            }
                        }

                        if last_event.is_some_and(|last| last.elapsed() >= DEBOUNCE) {
                            last_event = None;
                            if let Err(e) = authorizer.reload().await {
                                warn!(error = %e, "Failed to reload authorization rules, keeping previous rules");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Rules watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

fn rewatch(watcher: &Mutex<Option<RecommendedWatcher>>, path: &Path) -> Result<(), notify::Error> {
    match watcher.lock().as_mut() {
        Some(watcher) => watcher.watch(path, RecursiveMode::NonRecursive),
        None => Ok(()),
    }
}
