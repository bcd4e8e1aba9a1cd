//! On-disk layout of the state directory
//!
//! ```text
//! <state_dir>/
//! └── <environment>/
//!     ├── state.json
//!     ├── state.json.backup
//!     ├── lock.json
//!     └── runs/<run_id>/
//!         ├── run.json
//!         └── checkpoint.json
//! ```

use crate::error::{Result, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const STATE_FILE: &str = "state.json";
pub const STATE_BACKUP: &str = "state.json.backup";
pub const LOCK_FILE: &str = "lock.json";
pub const RUNS_DIR: &str = "runs";
pub const RUN_FILE: &str = "run.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Paths inside a state directory
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env_dir(&self, environment: &str) -> PathBuf {
        self.root.join(environment)
    }

    pub fn state_path(&self, environment: &str) -> PathBuf {
        self.env_dir(environment).join(STATE_FILE)
    }

    pub fn backup_path(&self, environment: &str) -> PathBuf {
        self.env_dir(environment).join(STATE_BACKUP)
    }

    pub fn lock_path(&self, environment: &str) -> PathBuf {
        self.env_dir(environment).join(LOCK_FILE)
    }

    pub fn run_dir(&self, environment: &str, run_id: &str) -> PathBuf {
        self.env_dir(environment).join(RUNS_DIR).join(run_id)
    }

    pub fn run_path(&self, environment: &str, run_id: &str) -> PathBuf {
        self.run_dir(environment, run_id).join(RUN_FILE)
    }

    pub fn checkpoint_path(&self, environment: &str, run_id: &str) -> PathBuf {
        self.run_dir(environment, run_id).join(CHECKPOINT_FILE)
    }

    /// Find which environment a run belongs to
    pub async fn find_run_environment(&self, run_id: &str) -> Result<Option<String>> {
        if !self.root.exists() {
            return Ok(None);
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::unavailable(&self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::unavailable(&self.root, e))?
        {
            let Some(environment) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.run_path(&environment, run_id).exists() {
                return Ok(Some(environment));
            }
        }
        Ok(None)
    }
}

/// Create a directory (and parents) or fail with `StoreUnavailable`
pub async fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::unavailable(dir, e))?;
        tracing::debug!(dir = %dir.display(), "Created state directory");
    }
    Ok(())
}

/// Write JSON by writing a temporary sibling file and renaming it over the target
///
/// Readers only ever observe the previous or the new content.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }

    let content = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|e| StoreError::unavailable(&tmp, e))?;
    file.write_all(&content)
        .await
        .map_err(|e| StoreError::unavailable(&tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::unavailable(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::unavailable(path, e))?;
    Ok(())
}

/// Read JSON; `None` when the file does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::unavailable(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Serialization {
            path: path.to_path_buf(),
            source,
        })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
