//! Per-project entry point
//!
//! A [`Workspace`] ties a KDL project directory to its state directory, a
//! live client and the user settings, and exposes the plan/apply cycle per
//! environment. Every mutating operation holds the environment lock for
//! its whole duration.

use crate::error::{Error, Result};
use dataiku_iac_config::{Settings, find_project_file, project_root_of};
use dataiku_iac_core::load_project_from_root_with_environment;
use dataiku_iac_dss::{DssClient, DssConfig};
use dataiku_iac_engine::{
    ApplyError, ApplyResult, CancelHandle, ChangeSet, Executor, ExecutorConfig, FileRunStore,
    PlanOptions, RollbackResult, RunRecord, diff_with_options,
};
use dataiku_iac_state::{
    DriftReport, FileLockManager, FileStateStore, LiveClient, Lock, LockManager, StateSnapshot,
    StateStore, default_holder, diff_against_live,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, instrument, warn};

pub struct Workspace {
    root: PathBuf,
    state_dir: PathBuf,
    settings: Settings,
    holder: String,
    store: Arc<FileStateStore>,
    locks: Arc<dyn LockManager>,
    client: Arc<dyn LiveClient>,
    executor: Executor,
}

impl Workspace {
    /// Locate the project from the current directory and load the global
    /// settings
    pub fn discover() -> Result<Self> {
        let project_file = find_project_file()?;
        let root = project_root_of(&project_file)
            .ok_or_else(|| Error::ProjectRootNotFound(project_file.clone()))?;
        let settings = Settings::load()?;
        Self::open(root, settings)
    }

    /// Open `root` against the DSS instance configured in `settings`
    pub fn open(root: impl Into<PathBuf>, settings: Settings) -> Result<Self> {
        let config = DssConfig::from_settings(&settings.dss)?;
        let client = DssClient::new(config)?;
        info!(url = %client.base_url(), "Using DSS instance");
        Ok(Self::with_live_client(root, settings, Arc::new(client)))
    }

    /// Open `root` against an arbitrary live client
    pub fn with_live_client(
        root: impl Into<PathBuf>,
        settings: Settings,
        client: Arc<dyn LiveClient>,
    ) -> Self {
        let root = root.into();
        let state_dir = settings.resolve_state_dir(&root);
        let store = Arc::new(FileStateStore::new(&state_dir));
        let runs = Arc::new(FileRunStore::new(&state_dir));
        let locks: Arc<dyn LockManager> = Arc::new(FileLockManager::new(&state_dir));
        let executor = Executor::new(client.clone(), store.clone(), runs)
            .with_config(ExecutorConfig::from(&settings));

        Self {
            root,
            state_dir,
            settings,
            holder: default_holder(),
            store,
            locks,
            client,
            executor,
        }
    }

    /// Identify lock ownership as `holder` instead of host and pid
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Compute the change set reconciling `environment` with the project
    ///
    /// Reads the persisted snapshot but never writes anything.
    pub async fn plan(&self, environment: &str) -> Result<ChangeSet> {
        self.plan_with_options(environment, &PlanOptions::default())
            .await
    }

    #[instrument(skip(self, options))]
    pub async fn plan_with_options(
        &self,
        environment: &str,
        options: &PlanOptions,
    ) -> Result<ChangeSet> {
        let project = load_project_from_root_with_environment(&self.root, Some(environment))?;
        let graph = project.build_graph()?;
        let snapshot = self.store.load(environment).await?;

        let change_set = diff_with_options(&graph, &snapshot, options)?;
        info!(summary = %change_set.summary(), "Plan computed");
        Ok(change_set)
    }

    /// Apply a change set produced by [`plan`](Self::plan)
    pub async fn apply(&self, environment: &str, change_set: &ChangeSet) -> Result<ApplyResult> {
        self.apply_with_cancel(environment, change_set, &CancelHandle::new())
            .await
    }

    #[instrument(skip(self, change_set, cancel))]
    pub async fn apply_with_cancel(
        &self,
        environment: &str,
        change_set: &ChangeSet,
        cancel: &CancelHandle,
    ) -> Result<ApplyResult> {
        self.locked(environment, async {
            let snapshot = self.store.load(environment).await?;
            Ok(self
                .executor
                .apply_with_cancel(change_set, snapshot, cancel)
                .await?)
        })
        .await
    }

    /// Continue a failed or interrupted run
    pub async fn resume(&self, run_id: &str) -> Result<ApplyResult> {
        self.resume_with_cancel(run_id, &CancelHandle::new()).await
    }

    #[instrument(skip(self, cancel))]
    pub async fn resume_with_cancel(
        &self,
        run_id: &str,
        cancel: &CancelHandle,
    ) -> Result<ApplyResult> {
        let run = self.run(run_id).await?;
        self.locked(&run.environment, async {
            Ok(self.executor.resume_with_cancel(run_id, cancel).await?)
        })
        .await
    }

    /// Undo every entry a run applied
    #[instrument(skip(self))]
    pub async fn rollback(&self, run_id: &str) -> Result<RollbackResult> {
        let run = self.run(run_id).await?;
        self.locked(&run.environment, async {
            Ok(self.executor.rollback(run_id).await?)
        })
        .await
    }

    /// Persisted record of a run
    pub async fn run(&self, run_id: &str) -> Result<RunRecord> {
        self.executor
            .run_record(run_id)
            .await?
            .ok_or_else(|| ApplyError::RunNotFound(run_id.to_string()).into())
    }

    pub async fn show_state(&self, environment: &str) -> Result<StateSnapshot> {
        Ok(self.store.load(environment).await?)
    }

    /// Compare the recorded state of `environment` with the live system
    #[instrument(skip(self))]
    pub async fn detect_drift(&self, environment: &str) -> Result<DriftReport> {
        let snapshot = self.store.load(environment).await?;
        Ok(diff_against_live(&snapshot, self.client.as_ref()).await?)
    }

    pub async fn lock_status(&self, environment: &str) -> Result<Option<Lock>> {
        Ok(self.locks.current(environment).await?)
    }

    /// Remove the lock of `environment` whoever holds it
    #[instrument(skip(self))]
    pub async fn force_unlock(&self, environment: &str) -> Result<()> {
        if let Some(lock) = self.locks.current(environment).await? {
            warn!(holder = %lock.holder, "Forcibly releasing lock");
        }
        Ok(self.locks.force_unlock(environment).await?)
    }

    /// Run `operation` while holding the lock of `environment`
    ///
    /// The lease is renewed every third of its length while the operation
    /// runs. The lock is released whatever the outcome; a release failure
    /// is only logged so the operation's own result reaches the caller.
    async fn locked<T, F>(&self, environment: &str, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let lease = self.settings.lease();
        let mut lock = self
            .locks
            .acquire(environment, &self.holder, lease)
            .await?;

        let every = (lease / 3).max(Duration::from_millis(10));
        let mut renewal = time::interval_at(Instant::now() + every, every);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut held = true;

        tokio::pin!(operation);
        let result = loop {
            tokio::select! {
                result = &mut operation => break result,
                _ = renewal.tick(), if held => match self.locks.renew(&lock).await {
                    Ok(renewed) => lock = renewed,
                    Err(err) => {
                        warn!(error = %err, "Lost the environment lock while running");
                        held = false;
                    }
                },
            }
        };

        if let Err(err) = self.locks.release(&lock).await {
            warn!(error = %err, "Failed to release lock");
        }
        result
    }
}
