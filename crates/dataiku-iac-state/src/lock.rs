//! Per-environment lock manager
//!
//! Only one holder may mutate an environment's state at a time. Locks carry
//! a lease; a lock older than its lease is considered abandoned and is
//! reclaimed by the next `acquire`.

use crate::error::{LockError, StoreError};
use crate::layout::{StateLayout, ensure_dir, read_json, write_json_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

type Result<T> = std::result::Result<T, LockError>;

/// Exclusive right to mutate one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub environment: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub lease_ms: u64,
}

impl Lock {
    pub fn new(environment: &str, holder: &str, lease: Duration) -> Self {
        Self {
            environment: environment.to_string(),
            holder: holder.to_string(),
            acquired_at: Utc::now(),
            lease_ms: lease.as_millis() as u64,
        }
    }

    /// `now - acquired_at > lease`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.acquired_at);
        age.num_milliseconds() > self.lease_ms as i64
    }

    /// Same lock with the lease restarted now
    pub fn renewed(&self) -> Self {
        Self {
            acquired_at: Utc::now(),
            ..self.clone()
        }
    }

    fn same_holding(&self, other: &Lock) -> bool {
        self.holder == other.holder && self.acquired_at == other.acquired_at
    }
}

/// Default holder identity: host name and process id
pub fn default_holder() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the lock or fail with `AlreadyLocked`
    async fn acquire(&self, environment: &str, holder: &str, lease: Duration) -> Result<Lock>;

    /// Release a lock held by `lock.holder`; `NotHolder` otherwise
    async fn release(&self, lock: &Lock) -> Result<()>;

    /// Restart the lease of a lock still held as `lock`
    ///
    /// Returns the renewed lock, or `NotHolder` when the lock was released
    /// or reclaimed in the meantime.
    async fn renew(&self, lock: &Lock) -> Result<Lock>;

    /// Clear the lock regardless of holder
    async fn force_unlock(&self, environment: &str) -> Result<()>;

    /// Current lock, expired or not
    async fn current(&self, environment: &str) -> Result<Option<Lock>>;
}

/// `lock.json` backend
///
/// Acquisition creates the lock file with `create_new`, so of two
/// concurrent callers exactly one succeeds.
pub struct FileLockManager {
    layout: StateLayout,
}

impl FileLockManager {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            layout: StateLayout::new(state_dir),
        }
    }

    async fn try_create(&self, lock: &Lock) -> Result<bool> {
        let path = self.layout.lock_path(&lock.environment);
        let content = serde_json::to_vec_pretty(lock).map_err(|source| {
            StoreError::Serialization {
                path: path.clone(),
                source,
            }
        })?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(StoreError::unavailable(&path, e).into()),
        };
        file.write_all(&content)
            .await
            .map_err(|e| StoreError::unavailable(&path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::unavailable(&path, e))?;
        Ok(true)
    }

    async fn remove(&self, environment: &str) -> Result<()> {
        let path = self.layout.lock_path(environment);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::unavailable(&path, e).into()),
        }
    }
}

#[async_trait]
impl LockManager for FileLockManager {
    #[tracing::instrument(skip(self, lease))]
    async fn acquire(&self, environment: &str, holder: &str, lease: Duration) -> Result<Lock> {
        ensure_dir(&self.layout.env_dir(environment)).await?;

        // One retry after reclaiming an expired lock
        for _ in 0..2 {
            let lock = Lock::new(environment, holder, lease);
            if self.try_create(&lock).await? {
                tracing::debug!("Acquired state lock");
                return Ok(lock);
            }

            let existing = match self.current(environment).await {
                Ok(existing) => existing,
                // Another holder is still writing the file it just created
                Err(LockError::Store(StoreError::Serialization { .. })) => {
                    return Err(LockError::AlreadyLocked {
                        environment: environment.to_string(),
                        holder: "unknown".to_string(),
                        acquired_at: Utc::now(),
                    });
                }
                Err(e) => return Err(e),
            };
            let Some(existing) = existing else {
                // Released between our attempt and the read
                continue;
            };
            if !existing.is_expired(Utc::now()) {
                return Err(LockError::AlreadyLocked {
                    environment: environment.to_string(),
                    holder: existing.holder,
                    acquired_at: existing.acquired_at,
                });
            }

            // Re-read right before removal so a fresh lock is never deleted
            if self.current(environment).await?.as_ref() == Some(&existing) {
                tracing::warn!(
                    stale_holder = %existing.holder,
                    acquired_at = %existing.acquired_at,
                    "Reclaiming expired lock"
                );
                self.remove(environment).await?;
            }
        }

        let existing = self.current(environment).await?;
        Err(LockError::AlreadyLocked {
            environment: environment.to_string(),
            holder: existing
                .as_ref()
                .map(|l| l.holder.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            acquired_at: existing.map(|l| l.acquired_at).unwrap_or_else(Utc::now),
        })
    }

    #[tracing::instrument(skip(self, lock), fields(environment = %lock.environment, holder = %lock.holder))]
    async fn release(&self, lock: &Lock) -> Result<()> {
        match self.current(&lock.environment).await? {
            Some(current) if current.same_holding(lock) => {
                self.remove(&lock.environment).await?;
                tracing::debug!("Released state lock");
                Ok(())
            }
            _ => Err(LockError::NotHolder {
                environment: lock.environment.clone(),
                holder: lock.holder.clone(),
            }),
        }
    }

    #[tracing::instrument(skip(self, lock), fields(environment = %lock.environment, holder = %lock.holder))]
    async fn renew(&self, lock: &Lock) -> Result<Lock> {
        match self.current(&lock.environment).await? {
            Some(current) if current.same_holding(lock) => {
                let renewed = lock.renewed();
                write_json_atomic(&self.layout.lock_path(&lock.environment), &renewed).await?;
                tracing::debug!("Renewed state lock");
                Ok(renewed)
            }
            _ => Err(LockError::NotHolder {
                environment: lock.environment.clone(),
                holder: lock.holder.clone(),
            }),
        }
    }

    async fn force_unlock(&self, environment: &str) -> Result<()> {
        let current = self.current(environment).await?;
        tracing::warn!(
            environment = %environment,
            holder = current.as_ref().map(|l| l.holder.as_str()).unwrap_or("none"),
            "Force-unlocking environment"
        );
        self.remove(environment).await
    }

    async fn current(&self, environment: &str) -> Result<Option<Lock>> {
        Ok(read_json(&self.layout.lock_path(environment)).await?)
    }
}

/// In-memory backend for tests and single-process embedding
#[derive(Default)]
pub struct MemoryLockManager {
    locks: std::sync::Mutex<HashMap<String, Lock>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lock>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, environment: &str, holder: &str, lease: Duration) -> Result<Lock> {
        let mut locks = self.locks();
        if let Some(existing) = locks.get(environment) {
            if !existing.is_expired(Utc::now()) {
                return Err(LockError::AlreadyLocked {
                    environment: environment.to_string(),
                    holder: existing.holder.clone(),
                    acquired_at: existing.acquired_at,
                });
            }
            tracing::warn!(stale_holder = %existing.holder, "Reclaiming expired lock");
        }
        let lock = Lock::new(environment, holder, lease);
        locks.insert(environment.to_string(), lock.clone());
        Ok(lock)
    }

    async fn release(&self, lock: &Lock) -> Result<()> {
        let mut locks = self.locks();
        match locks.get(&lock.environment) {
            Some(current) if current == lock => {
                locks.remove(&lock.environment);
                Ok(())
            }
            _ => Err(LockError::NotHolder {
                environment: lock.environment.clone(),
                holder: lock.holder.clone(),
            }),
        }
    }

    async fn renew(&self, lock: &Lock) -> Result<Lock> {
        let mut locks = self.locks();
        match locks.get_mut(&lock.environment) {
            Some(current) if current == lock => {
                *current = lock.renewed();
                Ok(current.clone())
            }
            _ => Err(LockError::NotHolder {
                environment: lock.environment.clone(),
                holder: lock.holder.clone(),
            }),
        }
    }

    async fn force_unlock(&self, environment: &str) -> Result<()> {
        let removed = self.locks().remove(environment);
        tracing::warn!(
            environment = %environment,
            holder = removed.as_ref().map(|l| l.holder.as_str()).unwrap_or("none"),
            "Force-unlocking environment"
        );
        Ok(())
    }

    async fn current(&self, environment: &str) -> Result<Option<Lock>> {
        Ok(self.locks().get(environment).cloned())
    }
}
