//! Plan and apply error types

use dataiku_iac_core::{GraphError, ResourceAddress};
use dataiku_iac_state::{ClientError, RunState, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while planning; nothing has been mutated when these occur
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Cyclic dependency: {}", format_cycle(.path))]
    CyclicDependency { path: Vec<ResourceAddress> },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(
        "Stale plan for environment '{environment}': planned against version {planned}, state is at version {current}"
    )]
    StalePlan {
        environment: String,
        planned: u64,
        current: u64,
    },
}

fn format_cycle(path: &[ResourceAddress]) -> String {
    path.iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// How an entry failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient errors persisted past the retry limit
    Transient,
    Permanent,
    /// The entry exceeded its maximum duration
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Failure of a single change-set entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFailure {
    pub index: usize,
    pub address: ResourceAddress,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

impl EntryFailure {
    pub fn from_client(
        index: usize,
        address: ResourceAddress,
        error: &ClientError,
        attempts: u32,
    ) -> Self {
        let kind = if error.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        };
        Self {
            index,
            address,
            kind,
            message: error.message().to_string(),
            attempts,
        }
    }
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry #{} ({}) failed [{}] after {} attempt(s): {}",
            self.index, self.address, self.kind, self.attempts, self.message
        )
    }
}

/// Errors raised by apply, resume and rollback
///
/// Entry failures during apply are reported in the `ApplyResult`, not here.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Nothing to resume for run {run_id} (state: {state})")]
    NothingToResume { run_id: String, state: RunState },

    #[error("Run {run_id} is still in progress")]
    RunInProgress { run_id: String },

    #[error("Rollback of run {run_id} halted: {failure}; {} entries not rolled back: {remaining:?}", .remaining.len())]
    PartialRollback {
        run_id: String,
        failure: EntryFailure,
        remaining: Vec<usize>,
    },
}
