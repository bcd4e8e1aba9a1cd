//! Drift detection
//!
//! Compares the recorded state with what the live system reports, without
//! modifying either.

use crate::error::ClientError;
use crate::live::LiveClient;
use crate::snapshot::StateSnapshot;
use dataiku_iac_core::ResourceAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftChange {
    pub key: String,
    pub recorded: serde_json::Value,
    pub live: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftKind {
    /// Deleted out of band
    Missing,
    /// Live attributes differ from the recorded ones
    Changed { changes: Vec<DriftChange> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEntry {
    pub address: ResourceAddress,
    #[serde(flatten)]
    pub kind: DriftKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub environment: String,
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "No drift detected in {}", self.environment);
        }
        writeln!(f, "Drift detected in {}:", self.environment)?;
        for entry in &self.entries {
            match &entry.kind {
                DriftKind::Missing => writeln!(f, "  - {} (missing)", entry.address)?,
                DriftKind::Changed { changes } => {
                    writeln!(f, "  ~ {}", entry.address)?;
                    for change in changes {
                        writeln!(f, "      {}: {} -> {}", change.key, change.recorded, change.live)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Compare every record of `snapshot` with the live system
///
/// Only keys present in the recorded observed attributes are compared
/// (or the desired attributes when nothing was observed), so server-side
/// defaults do not show up as drift.
#[tracing::instrument(skip_all, fields(environment = %snapshot.environment))]
pub async fn diff_against_live(
    snapshot: &StateSnapshot,
    client: &dyn LiveClient,
) -> Result<DriftReport, ClientError> {
    let mut entries = Vec::new();

    for record in snapshot.records() {
        let live = client.read_resource(&record.address).await?;
        let Some(live) = live else {
            tracing::debug!(address = %record.address, "Resource missing on live system");
            entries.push(DriftEntry {
                address: record.address.clone(),
                kind: DriftKind::Missing,
            });
            continue;
        };

        let recorded = if record.observed.is_empty() {
            &record.attributes
        } else {
            &record.observed
        };
        let changes: Vec<DriftChange> = recorded
            .iter()
            .filter_map(|(key, value)| {
                let live_value = live
                    .attributes
                    .get(key)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                (&live_value != value).then(|| DriftChange {
                    key: key.clone(),
                    recorded: value.clone(),
                    live: live_value,
                })
            })
            .collect();

        if !changes.is_empty() {
            tracing::debug!(address = %record.address, changes = changes.len(), "Resource drifted");
            entries.push(DriftEntry {
                address: record.address.clone(),
                kind: DriftKind::Changed { changes },
            });
        }
    }

    tracing::info!(drifted = entries.len(), "Drift check complete");
    Ok(DriftReport {
        environment: snapshot.environment.clone(),
        entries,
    })
}
