use dataiku_iac_engine::{ApplyError, PlanError};
use dataiku_iac_state::{ClientError, LockError, StoreError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by [`Workspace`](crate::Workspace) operations
#[derive(Error, Debug)]
pub enum Error {
    /// Loading, parsing or templating the KDL project
    #[error(transparent)]
    Config(#[from] dataiku_iac_core::ConfigError),

    /// User settings (`settings.yaml` or `DATAIKU_IAC_*`)
    #[error(transparent)]
    Settings(#[from] dataiku_iac_config::ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Dss(#[from] dataiku_iac_dss::DssError),

    /// Live system failure during drift detection
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("cannot determine project root of {0}")]
    ProjectRootNotFound(PathBuf),
}

impl From<dataiku_iac_core::GraphError> for Error {
    fn from(err: dataiku_iac_core::GraphError) -> Self {
        Self::Plan(PlanError::Graph(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
