//! Rollback of apply runs
//!
//! Undoes every succeeded entry of a run, most recently completed first:
//! created resources are deleted, updated resources get their previous
//! attributes back, and deleted resources are recreated.

use crate::action::{ActionType, ChangeSetEntry};
use crate::error::{ApplyError, EntryFailure, PlanError};
use crate::executor::{Executor, call_live};
use crate::run::RunRecord;
use chrono::Utc;
use dataiku_iac_state::{ResourceRecord, RunState, StateSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub run_id: String,
    pub environment: String,
    /// Entries undone by this invocation, in undo order
    pub rolled_back: Vec<usize>,
    pub snapshot_version: u64,
}

enum Undone {
    Removed,
    Restored(ResourceRecord),
    Unchanged,
}

impl Executor {
    /// Roll back every succeeded entry of `run_id`
    ///
    /// The first failing inverse halts the rollback with `PartialRollback`;
    /// entries undone so far stay undone and calling rollback again
    /// continues with the rest.
    #[instrument(skip(self))]
    pub async fn rollback(&self, run_id: &str) -> Result<RollbackResult, ApplyError> {
        let mut record = self
            .runs()
            .load_run(run_id)
            .await?
            .ok_or_else(|| ApplyError::RunNotFound(run_id.to_string()))?;

        if matches!(record.state, RunState::Planned | RunState::Applying) {
            return Err(ApplyError::RunInProgress {
                run_id: run_id.to_string(),
            });
        }

        let mut snapshot = self.store().load(&record.environment).await?;
        if let Some(version) = record.final_version
            && snapshot.version != version
        {
            return Err(PlanError::StalePlan {
                environment: record.environment.clone(),
                planned: version,
                current: snapshot.version,
            }
            .into());
        }

        let order = record.rollback_order();
        info!(entries = order.len(), "Rolling back run");

        let mut undone = Vec::with_capacity(order.len());
        for (position, &index) in order.iter().enumerate() {
            let Some(entry) = record.change_set.entry(index).cloned() else {
                continue;
            };
            let prior = record.prior.get(index).cloned().flatten();

            match self.undo(&entry, prior).await {
                Ok(change) => {
                    match change {
                        Undone::Removed => {
                            snapshot.remove(&entry.address);
                        }
                        Undone::Restored(restored) => snapshot.upsert(restored),
                        Undone::Unchanged => {}
                    }
                    record.rolled_back.push(index);
                    undone.push(index);
                    info!(index, address = %entry.address, "Entry rolled back");
                }
                Err(failure) => {
                    warn!(index, address = %entry.address, "Rollback halted: {}", failure);
                    if !undone.is_empty() {
                        self.persist_rollback(&mut record, &mut snapshot).await?;
                    }
                    return Err(ApplyError::PartialRollback {
                        run_id: run_id.to_string(),
                        failure,
                        remaining: order[position..].to_vec(),
                    });
                }
            }
        }

        let snapshot_version = if undone.is_empty() {
            snapshot.version
        } else {
            self.persist_rollback(&mut record, &mut snapshot).await?
        };
        self.runs()
            .remove_checkpoint(&record.environment, &record.run_id)
            .await?;

        info!(rolled_back = undone.len(), "Rollback complete");
        Ok(RollbackResult {
            run_id: record.run_id,
            environment: record.environment,
            rolled_back: undone,
            snapshot_version,
        })
    }

    async fn persist_rollback(
        &self,
        record: &mut RunRecord,
        snapshot: &mut StateSnapshot,
    ) -> Result<u64, ApplyError> {
        snapshot.last_sync = Some(Utc::now());
        let version = self.store().save(&record.environment, snapshot).await?;
        record.final_version = Some(version);
        self.runs().save_run(record).await?;
        Ok(version)
    }

    async fn undo(
        &self,
        entry: &ChangeSetEntry,
        prior: Option<ResourceRecord>,
    ) -> Result<Undone, EntryFailure> {
        let client = self.client();
        let retry = &self.config().retry;
        let timeout = self.config().entry_timeout;
        let address = &entry.address;

        match (entry.action, prior) {
            (ActionType::Create, _) => {
                let (result, _) = call_live(retry, timeout, entry.index, address, || {
                    client.delete_resource(address)
                })
                .await;
                result.map(|()| Undone::Removed)
            }
            // Only the recorded dependencies changed
            (ActionType::Update, Some(previous)) if entry.diff.is_empty() => {
                Ok(Undone::Restored(previous))
            }
            (ActionType::Update, Some(previous)) => {
                let (result, _) = call_live(retry, timeout, entry.index, address, || {
                    client.update_resource(address, &previous.attributes)
                })
                .await;
                let live = result?;
                Ok(Undone::Restored(previous.with_observed(live.attributes)))
            }
            (ActionType::Delete, Some(previous)) => {
                let (result, _) = call_live(retry, timeout, entry.index, address, || {
                    client.create_resource(address, &previous.attributes)
                })
                .await;
                let live = result?;
                Ok(Undone::Restored(
                    previous
                        .with_observed(live.attributes)
                        .with_remote_id(live.remote_id),
                ))
            }
            (ActionType::Update | ActionType::Delete, None) | (ActionType::NoOp, _) => {
                Ok(Undone::Unchanged)
            }
        }
    }
}
