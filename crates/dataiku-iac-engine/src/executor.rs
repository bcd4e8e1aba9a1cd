//! Apply engine
//!
//! Executes a change set against the live system. Entries start in index
//! order once every prerequisite entry has succeeded; independent entries
//! run concurrently on a bounded pool of tokio tasks. Progress is
//! checkpointed after every completed entry so an interrupted or failed run
//! can be resumed or rolled back.

use crate::action::{
    ActionType, ApplyResult, ChangeSet, ChangeSetEntry, EntryOutcome, EntryStatus,
};
use crate::error::{ApplyError, EntryFailure, FailureKind, PlanError};
use crate::retry::with_retry;
use crate::run::{RunRecord, RunStore};
use chrono::Utc;
use dataiku_iac_config::{RetrySettings, Settings};
use dataiku_iac_core::ResourceAddress;
use dataiku_iac_state::{
    Checkpoint, ClientError, LiveClient, LiveResource, ResourceRecord, RunState, StateSnapshot,
    StateStore, StoreError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Execution settings
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Maximum number of entries in flight
    pub workers: usize,
    /// Maximum duration of one entry, retries included
    pub entry_timeout: Duration,
    pub retry: RetrySettings,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ExecutorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            workers: settings.workers,
            entry_timeout: settings.entry_timeout(),
            retry: settings.retry.clone(),
        }
    }
}

/// Cancels a running apply
///
/// Entries already running finish; no new entry starts and the run ends
/// `Aborted` with a final checkpoint.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Executor {
    client: Arc<dyn LiveClient>,
    store: Arc<dyn StateStore>,
    runs: Arc<dyn RunStore>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        client: Arc<dyn LiveClient>,
        store: Arc<dyn StateStore>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            client,
            store,
            runs,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> &dyn LiveClient {
        self.client.as_ref()
    }

    pub(crate) fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub(crate) fn runs(&self) -> &dyn RunStore {
        self.runs.as_ref()
    }

    pub async fn run_record(&self, run_id: &str) -> Result<Option<RunRecord>, ApplyError> {
        Ok(self.runs.load_run(run_id).await?)
    }

    pub async fn apply(
        &self,
        change_set: &ChangeSet,
        snapshot: StateSnapshot,
    ) -> Result<ApplyResult, ApplyError> {
        self.apply_with_cancel(change_set, snapshot, &CancelHandle::new())
            .await
    }

    /// Apply `change_set` on top of `snapshot`
    ///
    /// Fails with `StalePlan` before anything is mutated when the change
    /// set was computed against another snapshot version, or when
    /// `snapshot` is not the persisted one.
    #[instrument(skip_all, fields(environment = %change_set.environment, entries = change_set.len()))]
    pub async fn apply_with_cancel(
        &self,
        change_set: &ChangeSet,
        snapshot: StateSnapshot,
        cancel: &CancelHandle,
    ) -> Result<ApplyResult, ApplyError> {
        if change_set.base_version != snapshot.version
            || change_set.environment != snapshot.environment
        {
            return Err(PlanError::StalePlan {
                environment: change_set.environment.clone(),
                planned: change_set.base_version,
                current: snapshot.version,
            }
            .into());
        }
        let persisted = self.store.load(&change_set.environment).await?;
        if persisted.version != snapshot.version {
            return Err(PlanError::StalePlan {
                environment: change_set.environment.clone(),
                planned: change_set.base_version,
                current: persisted.version,
            }
            .into());
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let mut record = RunRecord::new(&run_id, change_set.clone(), &snapshot);
        record.state = RunState::Applying;
        self.runs.save_run(&record).await?;

        let checkpoint = Checkpoint::new(&run_id, snapshot);
        self.runs.save_checkpoint(&checkpoint).await?;

        info!(run_id = %run_id, "Starting apply run");
        self.execute(record, checkpoint, cancel).await
    }

    pub async fn resume(&self, run_id: &str) -> Result<ApplyResult, ApplyError> {
        self.resume_with_cancel(run_id, &CancelHandle::new()).await
    }

    /// Continue a run from its last checkpoint
    ///
    /// Every entry not yet completed is applied, starting from the
    /// checkpointed snapshot. A run left `Applying` by a process that died
    /// is treated as interrupted and can be resumed as well.
    #[instrument(skip(self, cancel))]
    pub async fn resume_with_cancel(
        &self,
        run_id: &str,
        cancel: &CancelHandle,
    ) -> Result<ApplyResult, ApplyError> {
        let mut record = self
            .runs
            .load_run(run_id)
            .await?
            .ok_or_else(|| ApplyError::RunNotFound(run_id.to_string()))?;

        let resumable = record.state.is_resumable() || record.state == RunState::Applying;
        if !resumable || !record.rolled_back.is_empty() {
            return Err(ApplyError::NothingToResume {
                run_id: run_id.to_string(),
                state: record.state,
            });
        }

        let Some(mut checkpoint) = self
            .runs
            .load_checkpoint(&record.environment, run_id)
            .await?
        else {
            return Err(ApplyError::NothingToResume {
                run_id: run_id.to_string(),
                state: record.state,
            });
        };

        let persisted = self.store.load(&record.environment).await?;
        if persisted.version != checkpoint.snapshot.version {
            return Err(PlanError::StalePlan {
                environment: record.environment.clone(),
                planned: checkpoint.snapshot.version,
                current: persisted.version,
            }
            .into());
        }

        record.state = RunState::Applying;
        record.finished_at = None;
        self.runs.save_run(&record).await?;
        checkpoint.run_state = RunState::Applying;

        info!(
            completed = checkpoint.completed.len(),
            last_completed = ?checkpoint.last_completed,
            "Resuming run"
        );
        self.execute(record, checkpoint, cancel).await
    }

    #[instrument(skip_all, fields(run_id = %record.run_id, environment = %record.environment))]
    async fn execute(
        &self,
        mut record: RunRecord,
        mut checkpoint: Checkpoint,
        cancel: &CancelHandle,
    ) -> Result<ApplyResult, ApplyError> {
        let started = Instant::now();
        let change_set = Arc::new(record.change_set.clone());
        let count = change_set.len();

        let mut status: Vec<EntryStatus> = (0..count)
            .map(|i| {
                if checkpoint.is_completed(i) {
                    EntryStatus::Succeeded
                } else {
                    EntryStatus::Pending
                }
            })
            .collect();
        let mut attempts = record.attempts.clone();
        attempts.resize(count, 0);

        let mut snapshot = checkpoint.snapshot.clone();
        let mut failures: Vec<EntryFailure> = Vec::new();
        let mut store_error: Option<StoreError> = None;
        let mut changed_now = 0usize;
        let mut failed = false;
        let mut cancelled = false;
        let mut cancel_closed = false;
        let mut cancel_rx = cancel.subscribe();

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks: JoinSet<(usize, EntryRun)> = JoinSet::new();
        let mut running = 0usize;

        loop {
            if !cancelled && *cancel_rx.borrow() {
                cancelled = true;
                info!("Cancellation requested, waiting for running entries");
            }

            if !failed && !cancelled && store_error.is_none() {
                for index in 0..count {
                    if status[index] != EntryStatus::Pending {
                        continue;
                    }
                    let entry = &change_set.entries[index];
                    let ready = entry
                        .depends_on
                        .iter()
                        .all(|&d| status.get(d) == Some(&EntryStatus::Succeeded));
                    if !ready {
                        continue;
                    }
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        break;
                    };

                    status[index] = EntryStatus::InProgress;
                    running += 1;
                    debug!(index, address = %entry.address, action = %entry.action, "Starting entry");

                    let change_set = Arc::clone(&change_set);
                    let client = Arc::clone(&self.client);
                    let retry = self.config.retry.clone();
                    let timeout = self.config.entry_timeout;
                    tasks.spawn(async move {
                        let entry = &change_set.entries[index];
                        let run = run_entry(client.as_ref(), entry, &retry, timeout).await;
                        drop(permit);
                        (index, run)
                    });
                }
            }

            if running == 0 {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        running = 0;
                        continue;
                    };
                    running -= 1;
                    match joined {
                        Ok((index, run)) => {
                            attempts[index] += run.attempts;
                            let entry = &change_set.entries[index];
                            match run.result {
                                Ok(live) => {
                                    if apply_to_snapshot(&mut snapshot, entry, live) {
                                        changed_now += 1;
                                    }
                                    status[index] = EntryStatus::Succeeded;

                                    checkpoint.record_completed(index);
                                    checkpoint.snapshot = snapshot.clone();
                                    if let Err(e) = self.runs.save_checkpoint(&checkpoint).await {
                                        error!(index, error = %e, "Failed to write checkpoint");
                                        store_error.get_or_insert(e);
                                    }
                                    info!(index, address = %entry.address, action = %entry.action, "Entry succeeded");
                                }
                                Err(failure) => {
                                    warn!(index, address = %entry.address, kind = %failure.kind, "{}", failure);
                                    status[index] = EntryStatus::Failed;
                                    failures.push(failure);
                                    failed = true;
                                }
                            }
                        }
                        Err(join_error) => {
                            error!(error = %join_error, "Entry task aborted");
                            failed = true;
                        }
                    }
                }
                changed = cancel_rx.changed(), if !cancelled && !cancel_closed => {
                    match changed {
                        Ok(()) => {
                            if *cancel_rx.borrow() {
                                cancelled = true;
                                info!("Cancellation requested, waiting for running entries");
                            }
                        }
                        Err(_) => cancel_closed = true,
                    }
                }
            }
        }

        // Entries whose task died without reporting
        for (index, state) in status.iter_mut().enumerate() {
            match state {
                EntryStatus::InProgress => {
                    *state = EntryStatus::Failed;
                    failures.push(EntryFailure {
                        index,
                        address: change_set.entries[index].address.clone(),
                        kind: FailureKind::Permanent,
                        message: "entry task terminated unexpectedly".to_string(),
                        attempts: attempts[index],
                    });
                }
                EntryStatus::Pending => *state = EntryStatus::Skipped,
                _ => {}
            }
        }

        let all_done = status.iter().all(|s| *s == EntryStatus::Succeeded);
        let mut run_state = if all_done {
            RunState::Completed
        } else if cancelled && !failed && store_error.is_none() {
            RunState::Aborted
        } else {
            RunState::PartiallyFailed
        };

        // Persist whatever changed, including progress of an earlier
        // invocation whose save did not go through
        let dirty = if changed_now == 0 && checkpoint.completed.is_empty() {
            false
        } else {
            match self.store.load(&record.environment).await {
                Ok(persisted) => persisted.resources != snapshot.resources,
                Err(e) => {
                    error!(error = %e, "Failed to read state; progress kept in checkpoint");
                    run_state = RunState::PartiallyFailed;
                    store_error.get_or_insert(e);
                    false
                }
            }
        };
        if dirty {
            snapshot.last_sync = Some(Utc::now());
            match self.store.save(&record.environment, &snapshot).await {
                Ok(version) => {
                    snapshot.version = version;
                    record.final_version = Some(version);
                    debug!(version, changed = changed_now, "State saved");
                }
                Err(e) => {
                    error!(error = %e, "Failed to save state; progress kept in checkpoint");
                    run_state = RunState::PartiallyFailed;
                    store_error.get_or_insert(e);
                }
            }
        } else if store_error.is_none() {
            debug!("State unchanged, version kept");
            record.final_version = Some(snapshot.version);
        }

        checkpoint.snapshot = snapshot.clone();
        checkpoint.run_state = run_state;
        let checkpoint_result = if run_state == RunState::Completed {
            self.runs
                .remove_checkpoint(&record.environment, &record.run_id)
                .await
        } else {
            self.runs.save_checkpoint(&checkpoint).await
        };
        if let Err(e) = checkpoint_result {
            error!(error = %e, "Failed to finalize checkpoint");
            store_error.get_or_insert(e);
        }

        record.state = run_state;
        record.entry_states = status.clone();
        record.attempts = attempts.clone();
        record.completed = checkpoint.completed.clone();
        record.failures = failures.clone();
        record.finished_at = Some(Utc::now());
        if let Err(e) = self.runs.save_run(&record).await {
            error!(error = %e, "Failed to save run record");
            store_error.get_or_insert(e);
        }

        if let Some(e) = store_error {
            return Err(e.into());
        }

        let result = ApplyResult {
            run_id: record.run_id.clone(),
            environment: record.environment.clone(),
            state: run_state,
            entries: change_set
                .entries
                .iter()
                .map(|entry| EntryOutcome {
                    index: entry.index,
                    address: entry.address.clone(),
                    action: entry.action,
                    status: status[entry.index],
                    attempts: attempts[entry.index],
                })
                .collect(),
            failures,
            snapshot,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            state = %result.state,
            succeeded = result.succeeded(),
            failed = result.failed(),
            skipped = result.skipped(),
            "Apply run finished"
        );
        Ok(result)
    }
}

struct EntryRun {
    result: Result<Option<LiveResource>, EntryFailure>,
    attempts: u32,
}

async fn run_entry(
    client: &dyn LiveClient,
    entry: &ChangeSetEntry,
    retry: &RetrySettings,
    timeout: Duration,
) -> EntryRun {
    let address = &entry.address;
    let attributes = &entry.attributes;
    let (result, attempts) = match entry.action {
        ActionType::Create => {
            let (result, attempts) = call_live(retry, timeout, entry.index, address, || {
                client.create_resource(address, attributes)
            })
            .await;
            (result.map(Some), attempts)
        }
        // Only the recorded dependencies change
        ActionType::Update if entry.diff.is_empty() => (Ok(None), 0),
        ActionType::Update => {
            let (result, attempts) = call_live(retry, timeout, entry.index, address, || {
                client.update_resource(address, attributes)
            })
            .await;
            (result.map(Some), attempts)
        }
        ActionType::Delete => {
            let (result, attempts) = call_live(retry, timeout, entry.index, address, || {
                client.delete_resource(address)
            })
            .await;
            (result.map(|()| None), attempts)
        }
        ActionType::NoOp => (Ok(None), 0),
    };
    EntryRun { result, attempts }
}

/// Call the live system with retry, bounded by `timeout`
pub(crate) async fn call_live<T, F, Fut>(
    retry: &RetrySettings,
    timeout: Duration,
    index: usize,
    address: &ResourceAddress,
    operation: F,
) -> (Result<T, EntryFailure>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempts = 0;
    let outcome = tokio::time::timeout(timeout, with_retry(retry, &mut attempts, operation)).await;
    let result = match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(EntryFailure::from_client(index, address.clone(), &err, attempts)),
        Err(_) => Err(EntryFailure {
            index,
            address: address.clone(),
            kind: FailureKind::Timeout,
            message: format!("exceeded {}ms", timeout.as_millis()),
            attempts,
        }),
    };
    (result, attempts)
}

/// Reflect a succeeded entry in the snapshot
///
/// Returns whether the snapshot content changed.
fn apply_to_snapshot(
    snapshot: &mut StateSnapshot,
    entry: &ChangeSetEntry,
    live: Option<LiveResource>,
) -> bool {
    match entry.action {
        ActionType::Create | ActionType::Update => {
            let existing = snapshot.get(&entry.address).cloned();
            let mut record = ResourceRecord::new(entry.address.clone(), entry.attributes.clone())
                .with_dependencies(entry.dependencies.clone());
            match live {
                Some(live) => {
                    let remote_id = live
                        .remote_id
                        .or_else(|| existing.as_ref().and_then(|r| r.remote_id.clone()));
                    record = record.with_observed(live.attributes).with_remote_id(remote_id);
                }
                // Dependency refresh: nothing was sent to the live system
                None => {
                    if let Some(existing) = &existing {
                        record = record
                            .with_observed(existing.observed.clone())
                            .with_remote_id(existing.remote_id.clone());
                    }
                }
            }
            if let Some(existing) = &existing {
                record.created_at = existing.created_at;
            }
            snapshot.upsert(record);
            true
        }
        ActionType::Delete => snapshot.remove(&entry.address).is_some(),
        ActionType::NoOp => false,
    }
}
