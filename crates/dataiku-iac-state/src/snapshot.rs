//! State snapshot model
//!
//! A snapshot is the versioned, per-environment record of every resource
//! the engine has applied, keyed by resource address.

use chrono::{DateTime, Utc};
use dataiku_iac_core::{Attributes, ResourceAddress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot schema version understood by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Versioned collection of resource records for one environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub schema_version: u32,

    /// Monotonic store version; 0 means never saved
    pub version: u64,

    pub environment: String,

    /// Last time the snapshot was reconciled with the live system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,

    /// Records indexed by address string (`kind:PROJECT.NAME`)
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
}

impl StateSnapshot {
    /// Empty snapshot at version 0
    pub fn empty(environment: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            version: 0,
            environment: environment.into(),
            last_sync: None,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }

    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceRecord> {
        self.resources.get(&address.to_string())
    }

    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.resources.contains_key(&address.to_string())
    }

    /// Add or replace a record
    pub fn upsert(&mut self, record: ResourceRecord) {
        self.resources.insert(record.address.to_string(), record);
        self.updated_at = Utc::now();
    }

    /// Remove a record
    pub fn remove(&mut self, address: &ResourceAddress) -> Option<ResourceRecord> {
        let result = self.resources.remove(&address.to_string());
        if result.is_some() {
            self.updated_at = Utc::now();
        }
        result
    }

    /// Records in key order
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// State of a single applied resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub address: ResourceAddress,

    /// Desired attributes as last applied
    #[serde(default)]
    pub attributes: Attributes,

    /// Last-known live attributes
    #[serde(default)]
    pub observed: Attributes,

    /// Dependencies at the time of apply (used to order deletes)
    #[serde(default)]
    pub depends_on: Vec<ResourceAddress>,

    /// Identifier assigned by the live system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn new(address: ResourceAddress, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            address,
            attributes,
            observed: Attributes::new(),
            depends_on: Vec::new(),
            remote_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dependencies(mut self, depends_on: Vec<ResourceAddress>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_observed(mut self, observed: Attributes) -> Self {
        self.observed = observed;
        self
    }

    pub fn with_remote_id(mut self, remote_id: Option<String>) -> Self {
        self.remote_id = remote_id;
        self
    }
}
