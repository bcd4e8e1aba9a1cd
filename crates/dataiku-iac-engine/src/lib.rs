//! dataiku-iac plan and apply engine
//!
//! - **Planner**: diffs a resource graph against a state snapshot and
//!   produces an ordered [`ChangeSet`]
//! - **Executor**: applies a change set with bounded concurrency,
//!   checkpointing after every entry; supports resume, rollback,
//!   cancellation, per-entry timeouts and retry of transient errors
//! - **Run store**: run records and checkpoints persisted next to the state

pub mod action;
pub mod error;
pub mod executor;
pub mod planner;
pub mod retry;
pub mod rollback;
pub mod run;

// Re-exports
pub use action::{
    ActionType, ApplyResult, AttributeChange, ChangeSet, ChangeSetEntry, EntryOutcome,
    EntryStatus, PlanSummary,
};
pub use error::{ApplyError, EntryFailure, FailureKind, PlanError};
pub use executor::{CancelHandle, Executor, ExecutorConfig};
pub use planner::{PlanOptions, attribute_diff, diff, diff_with_options};
pub use rollback::RollbackResult;
pub use run::{FileRunStore, MemoryRunStore, RunRecord, RunStore};
