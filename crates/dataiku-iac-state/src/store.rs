//! State store
//!
//! Persists one [`StateSnapshot`] per environment with optimistic versioning:
//! a save only succeeds when the caller's snapshot version matches the
//! persisted one, and advances the version by exactly one.

use crate::error::{Result, StoreError};
use crate::layout::{StateLayout, ensure_dir, write_json_atomic};
use crate::snapshot::{SCHEMA_VERSION, StateSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::sync::Mutex;

/// Storage backend for state snapshots
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the snapshot of an environment; empty (version 0) when none exists
    async fn load(&self, environment: &str) -> Result<StateSnapshot>;

    /// Persist a snapshot and return the new version
    ///
    /// Fails with `VersionConflict` when `snapshot.version` is not the
    /// currently persisted version.
    async fn save(&self, environment: &str, snapshot: &StateSnapshot) -> Result<u64>;
}

/// JSON file backend under `<state_dir>/<environment>/state.json`
pub struct FileStateStore {
    layout: StateLayout,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            layout: StateLayout::new(state_dir),
            write_lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    async fn read_snapshot(&self, environment: &str) -> Result<Option<StateSnapshot>> {
        let path = self.layout.state_path(environment);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::unavailable(&path, e)),
        };

        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|source| StoreError::Serialization {
                path: path.clone(),
                source,
            })?;

        // Schema check before decoding, newer layouts may not decode at all
        let found = value
            .get("schemaVersion")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if found > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found,
                supported: SCHEMA_VERSION,
            });
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::Serialization { path, source })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    #[tracing::instrument(skip(self))]
    async fn load(&self, environment: &str) -> Result<StateSnapshot> {
        match self.read_snapshot(environment).await? {
            Some(snapshot) => {
                tracing::debug!(
                    version = snapshot.version,
                    resources = snapshot.len(),
                    "Loaded state"
                );
                Ok(snapshot)
            }
            None => {
                tracing::debug!("State file not found, returning empty state");
                Ok(StateSnapshot::empty(environment))
            }
        }
    }

    #[tracing::instrument(skip(self, snapshot), fields(version = snapshot.version))]
    async fn save(&self, environment: &str, snapshot: &StateSnapshot) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        ensure_dir(&self.layout.env_dir(environment)).await?;

        let found = self
            .read_snapshot(environment)
            .await?
            .map(|s| s.version)
            .unwrap_or(0);
        if found != snapshot.version {
            return Err(StoreError::VersionConflict {
                environment: environment.to_string(),
                expected: snapshot.version,
                found,
            });
        }

        let mut next = snapshot.clone();
        next.schema_version = SCHEMA_VERSION;
        next.environment = environment.to_string();
        next.version = found + 1;
        next.updated_at = Utc::now();

        let path = self.layout.state_path(environment);
        let backup = self.layout.backup_path(environment);

        // Keep the previous state as a backup before replacing it
        if path.exists() {
            fs::copy(&path, &backup)
                .await
                .map_err(|e| StoreError::unavailable(&backup, e))?;
            tracing::debug!("Created state backup");
        }

        write_json_atomic(&path, &next).await?;

        tracing::info!(
            environment = %environment,
            version = next.version,
            resources = next.len(),
            "Saved state"
        );
        Ok(next.version)
    }
}

/// In-memory backend for tests and embedding
#[derive(Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<HashMap<String, StateSnapshot>>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::StoreUnavailable {
                path: "memory".into(),
                message: "store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, environment: &str) -> Result<StateSnapshot> {
        self.check_available()?;
        let snapshots = self.snapshots.lock().await;
        Ok(snapshots
            .get(environment)
            .cloned()
            .unwrap_or_else(|| StateSnapshot::empty(environment)))
    }

    async fn save(&self, environment: &str, snapshot: &StateSnapshot) -> Result<u64> {
        self.check_available()?;
        let mut snapshots = self.snapshots.lock().await;
        let found = snapshots.get(environment).map(|s| s.version).unwrap_or(0);
        if found != snapshot.version {
            return Err(StoreError::VersionConflict {
                environment: environment.to_string(),
                expected: snapshot.version,
                found,
            });
        }

        let mut next = snapshot.clone();
        next.environment = environment.to_string();
        next.version = found + 1;
        next.updated_at = Utc::now();
        snapshots.insert(environment.to_string(), next);
        Ok(found + 1)
    }
}
