//! dataiku-iac
//!
//! Declarative management of Dataiku DSS projects, datasets, recipes and
//! scenarios. Resources are declared in KDL, compared against a versioned
//! per-environment state snapshot and reconciled with the live instance.
//!
//! ```no_run
//! # async fn run() -> dataiku_iac::Result<()> {
//! dataiku_iac::logging::init();
//!
//! let workspace = dataiku_iac::Workspace::discover()?;
//! let change_set = workspace.plan("dev").await?;
//! println!("{change_set}");
//!
//! let result = workspace.apply("dev", &change_set).await?;
//! if !result.is_success() {
//!     workspace.resume(&result.run_id).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod logging;
pub mod workspace;

pub use error::{Error, Result};
pub use workspace::Workspace;

// Re-exports
pub use dataiku_iac_config::Settings;
pub use dataiku_iac_core::{ResourceAddress, ResourceKind};
pub use dataiku_iac_engine::{
    ActionType, ApplyResult, CancelHandle, ChangeSet, ChangeSetEntry, EntryStatus, PlanOptions,
    PlanSummary, RollbackResult, RunRecord,
};
pub use dataiku_iac_state::{DriftReport, InMemoryLiveClient, LiveClient, RunState, StateSnapshot};
