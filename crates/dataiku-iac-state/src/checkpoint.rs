//! Apply checkpoints
//!
//! A checkpoint is the durable progress record of one apply run: which
//! change-set entries completed and the snapshot after the last of them.
//! It is replaced atomically after every completed entry.

use crate::snapshot::{SCHEMA_VERSION, StateSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Overall state of an apply run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Planned,
    Applying,
    Completed,
    PartiallyFailed,
    Aborted,
}

impl RunState {
    /// Whether a run in this state can be resumed
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::PartiallyFailed | Self::Aborted)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyFailed | Self::Aborted
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Planned => write!(f, "planned"),
            RunState::Applying => write!(f, "applying"),
            RunState::Completed => write!(f, "completed"),
            RunState::PartiallyFailed => write!(f, "partially failed"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_id: String,
    pub environment: String,

    /// Highest entry index whose prefix `0..=index` has fully completed
    pub last_completed: Option<usize>,

    /// Every completed entry index, in completion order
    pub completed: Vec<usize>,

    /// Snapshot after the completed entries
    pub snapshot: StateSnapshot,

    pub run_state: RunState,

    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>, snapshot: StateSnapshot) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: run_id.into(),
            environment: snapshot.environment.clone(),
            last_completed: None,
            completed: Vec::new(),
            snapshot,
            run_state: RunState::Applying,
            created_at: Utc::now(),
        }
    }

    /// Record a completed entry and advance the contiguous watermark
    pub fn record_completed(&mut self, index: usize) {
        if self.completed.contains(&index) {
            return;
        }
        self.completed.push(index);

        let done: BTreeSet<usize> = self.completed.iter().copied().collect();
        let mut next = self.last_completed.map(|i| i + 1).unwrap_or(0);
        while done.contains(&next) {
            self.last_completed = Some(next);
            next += 1;
        }
        self.created_at = Utc::now();
    }

    pub fn is_completed(&self, index: usize) -> bool {
        self.completed.contains(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_tracks_contiguous_prefix() {
        let mut checkpoint = Checkpoint::new("run", StateSnapshot::empty("dev"));
        assert_eq!(checkpoint.last_completed, None);

        checkpoint.record_completed(1);
        assert_eq!(checkpoint.last_completed, None);

        checkpoint.record_completed(0);
        assert_eq!(checkpoint.last_completed, Some(1));

        checkpoint.record_completed(3);
        assert_eq!(checkpoint.last_completed, Some(1));
        checkpoint.record_completed(2);
        assert_eq!(checkpoint.last_completed, Some(3));

        assert_eq!(checkpoint.completed, vec![1, 0, 3, 2]);
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut checkpoint = Checkpoint::new("run", StateSnapshot::empty("dev"));
        checkpoint.record_completed(0);
        checkpoint.record_completed(0);
        assert_eq!(checkpoint.completed, vec![0]);
    }

    #[test]
    fn test_resumable_states() {
        assert!(RunState::PartiallyFailed.is_resumable());
        assert!(RunState::Aborted.is_resumable());
        assert!(!RunState::Completed.is_resumable());
        assert!(!RunState::Applying.is_resumable());
    }
}
