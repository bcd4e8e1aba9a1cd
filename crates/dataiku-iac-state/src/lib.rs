//! dataiku-iac state management
//!
//! Persistence and coordination primitives shared by the plan and apply
//! engines:
//!
//! - **Snapshots**: versioned per-environment record of applied resources
//! - **State stores**: file (atomic replace + backup) and in-memory backends
//! - **Checkpoints**: durable progress of an apply run
//! - **Locks**: per-environment exclusive access with lease expiry
//! - **Live client**: abstraction over the managed DSS instance
//! - **Drift**: comparison of recorded state with the live system

pub mod checkpoint;
pub mod drift;
pub mod error;
pub mod layout;
pub mod live;
pub mod lock;
pub mod snapshot;
pub mod store;

// Re-exports
pub use checkpoint::{Checkpoint, RunState};
pub use drift::{DriftChange, DriftEntry, DriftKind, DriftReport, diff_against_live};
pub use error::{ClientError, LockError, Result, StoreError};
pub use layout::StateLayout;
pub use live::{InMemoryLiveClient, LiveClient, LiveOperation, LiveResource};
pub use lock::{FileLockManager, Lock, LockManager, MemoryLockManager, default_holder};
pub use snapshot::{ResourceRecord, SCHEMA_VERSION, StateSnapshot};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
