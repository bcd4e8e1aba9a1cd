//! Live system client abstraction
//!
//! The apply engine talks to the managed system (a DSS instance) only
//! through [`LiveClient`]. Implementations classify failures as transient
//! (retried with backoff) or permanent.

use crate::error::ClientError;
use async_trait::async_trait;
use dataiku_iac_core::{Attributes, ResourceAddress};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Result<T> = std::result::Result<T, ClientError>;

/// A resource as seen on the live system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl LiveResource {
    pub fn new(remote_id: Option<String>, attributes: Attributes) -> Self {
        Self {
            remote_id,
            attributes,
        }
    }
}

#[async_trait]
pub trait LiveClient: Send + Sync {
    /// Read a resource; `None` if it does not exist
    async fn read_resource(&self, address: &ResourceAddress) -> Result<Option<LiveResource>>;

    async fn create_resource(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> Result<LiveResource>;

    /// Replace the managed attributes of an existing resource
    async fn update_resource(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> Result<LiveResource>;

    /// Delete a resource; deleting a missing resource succeeds
    async fn delete_resource(&self, address: &ResourceAddress) -> Result<()>;
}

/// Operation recorded by [`InMemoryLiveClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveOperation {
    Read,
    Create,
    Update,
    Delete,
}

/// In-memory live system
///
/// Used for dry runs and tests. Failures can be scripted per address and
/// operation, and an artificial latency makes concurrency observable.
#[derive(Default)]
pub struct InMemoryLiveClient {
    resources: Mutex<BTreeMap<ResourceAddress, LiveResource>>,
    failures: Mutex<HashMap<(ResourceAddress, LiveOperation), VecDeque<ClientError>>>,
    calls: Mutex<Vec<(LiveOperation, ResourceAddress)>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    next_id: AtomicUsize,
}

impl InMemoryLiveClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every mutating call by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = Some(latency);
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Fail the next call of `operation` on `address` with `error`
    ///
    /// Queued errors are consumed in order, one per call.
    pub fn fail_next(&self, address: &ResourceAddress, operation: LiveOperation, error: ClientError) {
        lock(&self.failures)
            .entry((address.clone(), operation))
            .or_default()
            .push_back(error);
    }

    /// Insert or replace a resource directly (out-of-band change)
    pub fn insert(&self, address: ResourceAddress, resource: LiveResource) {
        lock(&self.resources).insert(address, resource);
    }

    /// Remove a resource directly (out-of-band deletion)
    pub fn remove(&self, address: &ResourceAddress) -> Option<LiveResource> {
        lock(&self.resources).remove(address)
    }

    pub fn get(&self, address: &ResourceAddress) -> Option<LiveResource> {
        lock(&self.resources).get(address).cloned()
    }

    pub fn addresses(&self) -> Vec<ResourceAddress> {
        lock(&self.resources).keys().cloned().collect()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<(LiveOperation, ResourceAddress)> {
        lock(&self.calls).clone()
    }

    pub fn mutation_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|(op, _)| *op != LiveOperation::Read)
            .count()
    }

    /// Highest number of mutating calls observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn begin(&self, operation: LiveOperation, address: &ResourceAddress) -> Result<()> {
        lock(&self.calls).push((operation, address.clone()));

        if operation != LiveOperation::Read {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let latency = *lock(&self.latency);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
        }

        let scripted = lock(&self.failures)
            .get_mut(&(address.clone(), operation))
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(err) => {
                self.end(operation);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn end(&self, operation: LiveOperation) {
        if operation != LiveOperation::Read {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LiveClient for InMemoryLiveClient {
    async fn read_resource(&self, address: &ResourceAddress) -> Result<Option<LiveResource>> {
        self.begin(LiveOperation::Read, address).await?;
        Ok(self.get(address))
    }

    async fn create_resource(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> Result<LiveResource> {
        self.begin(LiveOperation::Create, address).await?;
        let result = {
            let mut resources = lock(&self.resources);
            if resources.contains_key(address) {
                Err(ClientError::Permanent(format!("{address} already exists")))
            } else if let Some(parent) = address.parent()
                && !resources.contains_key(&parent)
            {
                Err(ClientError::Permanent(format!(
                    "{parent} does not exist (required by {address})"
                )))
            } else {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let resource = LiveResource::new(Some(format!("mem-{id}")), attributes.clone());
                resources.insert(address.clone(), resource.clone());
                Ok(resource)
            }
        };
        self.end(LiveOperation::Create);
        result
    }

    async fn update_resource(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> Result<LiveResource> {
        self.begin(LiveOperation::Update, address).await?;
        let result = {
            let mut resources = lock(&self.resources);
            match resources.get_mut(address) {
                Some(existing) => {
                    existing.attributes = attributes.clone();
                    Ok(existing.clone())
                }
                None => Err(ClientError::Permanent(format!("{address} does not exist"))),
            }
        };
        self.end(LiveOperation::Update);
        result
    }

    async fn delete_resource(&self, address: &ResourceAddress) -> Result<()> {
        self.begin(LiveOperation::Delete, address).await?;
        lock(&self.resources).remove(address);
        self.end(LiveOperation::Delete);
        Ok(())
    }
}
