//! State, lock and live-client error types

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// State store errors
///
/// Surfaced immediately; callers must not assume any partial write happened.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("State store unavailable at {path}: {message}")]
    StoreUnavailable { path: PathBuf, message: String },

    #[error(
        "Version conflict for environment '{environment}': expected version {expected}, found {found}"
    )]
    VersionConflict {
        environment: String,
        expected: u64,
        found: u64,
    },

    #[error("State schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("Serialization error in {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn unavailable(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Lock manager errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Environment '{environment}' is locked by {holder} since {acquired_at}")]
    AlreadyLocked {
        environment: String,
        holder: String,
        acquired_at: DateTime<Utc>,
    },

    #[error("{holder} does not hold the lock for environment '{environment}'")]
    NotHolder { environment: String, holder: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by a live-system client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Temporary failure (network, throttling, 5xx); safe to retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// Failure that will not go away by retrying (validation, 4xx)
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
