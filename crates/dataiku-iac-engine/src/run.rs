//! Run records and their persistence
//!
//! A run record describes one apply run: the change set being applied,
//! each entry's status, and the records each entry replaces (for rollback).
//! Records and checkpoints live under `<state_dir>/<env>/runs/<run_id>/`
//! so resume and rollback work across processes.

use crate::action::{ChangeSet, EntryStatus};
use crate::error::EntryFailure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataiku_iac_state::layout::{read_json, write_json_atomic};
use dataiku_iac_state::{
    Checkpoint, ResourceRecord, RunState, SCHEMA_VERSION, StateLayout, StateSnapshot, StoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub environment: String,
    pub change_set: ChangeSet,
    pub state: RunState,
    pub entry_states: Vec<EntryStatus>,
    pub attempts: Vec<u32>,

    /// Record each entry's resource had before the run (by entry index)
    pub prior: Vec<Option<ResourceRecord>>,

    /// Completed entries in completion order
    #[serde(default)]
    pub completed: Vec<usize>,

    /// Failures of the latest invocation
    #[serde(default)]
    pub failures: Vec<EntryFailure>,

    /// Snapshot version persisted by the latest invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_version: Option<u64>,

    /// Entries whose effects were undone by rollback
    #[serde(default)]
    pub rolled_back: Vec<usize>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// New run in the `Planned` state; priors are taken from `snapshot`
    pub fn new(run_id: impl Into<String>, change_set: ChangeSet, snapshot: &StateSnapshot) -> Self {
        let prior = change_set
            .entries
            .iter()
            .map(|e| snapshot.get(&e.address).cloned())
            .collect();
        let len = change_set.len();
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: run_id.into(),
            environment: change_set.environment.clone(),
            change_set,
            state: RunState::Planned,
            entry_states: vec![EntryStatus::Pending; len],
            attempts: vec![0; len],
            prior,
            completed: Vec::new(),
            failures: Vec::new(),
            final_version: None,
            rolled_back: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Entries completed but not yet rolled back, most recent first
    pub fn rollback_order(&self) -> Vec<usize> {
        self.completed
            .iter()
            .rev()
            .copied()
            .filter(|i| !self.rolled_back.contains(i))
            .collect()
    }
}

/// Persistence of run records and checkpoints
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, record: &RunRecord) -> Result<()>;

    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Atomically replace the checkpoint of `checkpoint.run_id`
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn load_checkpoint(&self, environment: &str, run_id: &str) -> Result<Option<Checkpoint>>;

    /// Remove a checkpoint; removing a missing checkpoint succeeds
    async fn remove_checkpoint(&self, environment: &str, run_id: &str) -> Result<()>;
}

/// JSON files next to the environment's state file
pub struct FileRunStore {
    layout: StateLayout,
}

impl FileRunStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            layout: StateLayout::new(state_dir),
        }
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save_run(&self, record: &RunRecord) -> Result<()> {
        let path = self.layout.run_path(&record.environment, &record.run_id);
        write_json_atomic(&path, record).await?;
        debug!(run_id = %record.run_id, state = %record.state, "Saved run record");
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let Some(environment) = self.layout.find_run_environment(run_id).await? else {
            return Ok(None);
        };
        read_json(&self.layout.run_path(&environment, run_id)).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self
            .layout
            .checkpoint_path(&checkpoint.environment, &checkpoint.run_id);
        write_json_atomic(&path, checkpoint).await?;
        debug!(
            run_id = %checkpoint.run_id,
            completed = checkpoint.completed.len(),
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn load_checkpoint(&self, environment: &str, run_id: &str) -> Result<Option<Checkpoint>> {
        read_json(&self.layout.checkpoint_path(environment, run_id)).await
    }

    async fn remove_checkpoint(&self, environment: &str, run_id: &str) -> Result<()> {
        let path = self.layout.checkpoint_path(environment, run_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(run_id, "Removed checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::unavailable(&path, e)),
        }
    }
}

/// In-memory run store for tests and embedding
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, RunRecord>>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    checkpoint_writes: Mutex<usize>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoint writes so far
    pub fn checkpoint_writes(&self) -> usize {
        *lock(&self.checkpoint_writes)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_run(&self, record: &RunRecord) -> Result<()> {
        lock(&self.runs).insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(lock(&self.runs).get(run_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        lock(&self.checkpoints).insert(checkpoint.run_id.clone(), checkpoint.clone());
        *lock(&self.checkpoint_writes) += 1;
        Ok(())
    }

    async fn load_checkpoint(&self, environment: &str, run_id: &str) -> Result<Option<Checkpoint>> {
        Ok(lock(&self.checkpoints)
            .get(run_id)
            .filter(|c| c.environment == environment)
            .cloned())
    }

    async fn remove_checkpoint(&self, _environment: &str, run_id: &str) -> Result<()> {
        lock(&self.checkpoints).remove(run_id);
        Ok(())
    }
}
