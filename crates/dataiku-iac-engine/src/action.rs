//! Change sets and apply results
//!
//! A [`ChangeSet`] is the ordered list of actions that brings the recorded
//! state of one environment in line with its desired configuration.

use crate::error::EntryFailure;
use dataiku_iac_core::{Attributes, ResourceAddress};
use dataiku_iac_state::{RunState, StateSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of action to perform on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Update an existing resource
    Update,
    /// Delete a resource no longer declared
    Delete,
    /// No change needed
    NoOp,
}

impl ActionType {
    fn symbol(&self) -> char {
        match self {
            ActionType::Create => '+',
            ActionType::Update => '~',
            ActionType::Delete => '-',
            ActionType::NoOp => ' ',
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::NoOp => write!(f, "no-op"),
        }
    }
}

/// A single attribute difference; `Null` stands for an absent value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub key: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// One ordered step of a change set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetEntry {
    /// Position in the change set; also the execution order
    pub index: usize,
    pub address: ResourceAddress,
    pub action: ActionType,

    /// Changed attributes (every key for create and delete)
    #[serde(default)]
    pub diff: Vec<AttributeChange>,

    /// Topological depth within the entry's phase
    pub rank: usize,

    /// Indices of entries that must complete before this one
    #[serde(default)]
    pub depends_on: Vec<usize>,

    /// Full desired attributes; the recorded ones for a delete
    #[serde(default)]
    pub attributes: Attributes,

    /// Resource-level dependencies, persisted with the record
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,
}

impl fmt::Display for ChangeSetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.symbol(), self.address)
    }
}

/// Ordered change set for one environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub environment: String,

    /// Snapshot version the change set was computed against
    pub base_version: u64,

    pub entries: Vec<ChangeSetEntry>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&ChangeSetEntry> {
        self.entries.get(index)
    }

    /// Whether any entry would change the live system
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.action != ActionType::NoOp)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match entry.action {
                ActionType::Create => summary.create += 1,
                ActionType::Update => summary.update += 1,
                ActionType::Delete => summary.delete += 1,
                ActionType::NoOp => summary.no_change += 1,
            }
        }
        summary
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Plan for {} (state version {}):",
            self.environment, self.base_version
        )?;
        for entry in &self.entries {
            writeln!(f, "  {entry}")?;
            for change in &entry.diff {
                writeln!(f, "      {}: {} -> {}", change.key, change.before, change.after)?;
            }
        }
        write!(f, "{}", self.summary())
    }
}

/// Summary of a change set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.no_change
        )
    }
}

/// Execution status of a change-set entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    /// Not started because the run stopped early
    Skipped,
}

/// Outcome of one entry in an apply run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryOutcome {
    pub index: usize,
    pub address: ResourceAddress,
    pub action: ActionType,
    pub status: EntryStatus,
    pub attempts: u32,
}

/// Result of an apply or resume invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub run_id: String,
    pub environment: String,
    pub state: RunState,
    pub entries: Vec<EntryOutcome>,
    pub failures: Vec<EntryFailure>,
    /// Snapshot after the run, as persisted
    pub snapshot: StateSnapshot,
    pub duration_ms: u64,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn succeeded(&self) -> usize {
        self.count(EntryStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(EntryStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(EntryStatus::Skipped)
    }

    fn count(&self, status: EntryStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run {} {}: {} succeeded, {} failed, {} skipped ({}ms)",
            self.run_id,
            self.state,
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.duration_ms
        )
    }
}
