//! Deployment registry
//!
//! Owns every piece of per-API and per-label state: the latest synthesized
//! artifacts of each API, the labels it is served under, and each label's
//! members and proxy-facing objects. One instance is created per process
//! (or per test) and shared by reference.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{ApiDefinition, ApiKey, LabelEnvironments};
use crate::errors::{Error, Result};
use crate::xds::synthesis::ArtifactSet;

/// Latest deployed state of one API
#[derive(Debug, Clone)]
pub struct ApiRecord {
    pub definition: Arc<ApiDefinition>,
    pub content_hash: String,
    pub artifacts: Arc<ArtifactSet>,
    pub environments: LabelEnvironments,
}

impl ApiRecord {
    pub fn key(&self) -> ApiKey {
        self.definition.key()
    }

    pub fn labels(&self) -> BTreeSet<String> {
        self.environments.keys().cloned().collect()
    }
}

/// Aggregation state of one label
#[derive(Debug, Clone, Default)]
pub struct LabelState {
    pub name: String,
    pub members: BTreeSet<ApiKey>,
    /// Built on the first aggregation, reused afterwards
    pub listener: Option<Listener>,
    pub route_config: Option<RouteConfiguration>,
}

impl LabelState {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    apis: DashMap<ApiKey, ApiRecord>,
    api_locks: DashMap<ApiKey, Arc<Mutex<()>>>,
    labels: DashMap<String, Arc<Mutex<LabelState>>>,
    cluster_owners: DashMap<String, ApiKey>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api(&self, key: &ApiKey) -> Option<ApiRecord> {
        self.apis.get(key).map(|r| r.value().clone())
    }

    pub fn api_keys(&self) -> Vec<ApiKey> {
        let mut keys: Vec<ApiKey> = self.apis.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Store the record, re-indexing the clusters it owns. Names owned by
    /// another API keep their owner; see [`Registry::claim_clusters`].
    pub fn put_api(&self, record: ApiRecord) -> Option<ApiRecord> {
        let key = record.key();
        let owned: BTreeSet<String> = record.artifacts.cluster_names().into_iter().collect();
        let previous = self.apis.insert(key.clone(), record);
        for cluster in &owned {
            self.cluster_owners.entry(cluster.clone()).or_insert_with(|| key.clone());
        }
        if let Some(previous) = &previous {
            for cluster in previous.artifacts.cluster_names() {
                if !owned.contains(&cluster) {
                    self.cluster_owners.remove_if(&cluster, |_, owner| owner == &key);
                }
            }
        }
        previous
    }

    /// Reserve cluster names for `key` before its artifacts are published.
    ///
    /// Fails on the first name another API already owns, leaving nothing
    /// reserved. Returns the names this call reserved so a failed deploy
    /// can hand them back with [`Registry::release_clusters`].
    pub fn claim_clusters(&self, key: &ApiKey, names: &[String]) -> Result<Vec<String>> {
        let mut claimed = Vec::new();
        for name in names {
            match self.cluster_owners.entry(name.clone()) {
                Entry::Occupied(slot) if slot.get() == key => {}
                Entry::Occupied(slot) => {
                    let owner = slot.get().clone();
                    drop(slot);
                    self.release_clusters(key, &claimed);
                    return Err(Error::validation(format!(
                        "cluster {} is already provided by API {}",
                        name, owner
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(key.clone());
                    claimed.push(name.clone());
                }
            }
        }
        Ok(claimed)
    }

    pub fn release_clusters(&self, key: &ApiKey, names: &[String]) {
        for name in names {
            self.cluster_owners.remove_if(name, |_, owner| owner == key);
        }
    }

    pub fn remove_api(&self, key: &ApiKey) -> Option<ApiRecord> {
        let (_, removed) = self.apis.remove(key)?;
        self.unindex(key, &removed);
        Some(removed)
    }

    /// API whose artifacts contain the cluster.
    pub fn cluster_owner(&self, cluster_name: &str) -> Option<ApiKey> {
        self.cluster_owners.get(cluster_name).map(|k| k.value().clone())
    }

    /// Serializes deploy, undeploy and endpoint updates of one API.
    pub async fn lock_api(&self, key: &ApiKey) -> OwnedMutexGuard<()> {
        let lock = self.api_locks.entry(key.clone()).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Label state, created empty on first use.
    pub fn label(&self, name: &str) -> Arc<Mutex<LabelState>> {
        self.labels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LabelState::new(name))))
            .value()
            .clone()
    }

    /// Lock the given labels in name order.
    ///
    /// Every multi-label operation goes through here so two deployments
    /// touching overlapping labels cannot deadlock.
    pub async fn lock_labels(
        &self,
        names: &BTreeSet<String>,
    ) -> Vec<OwnedMutexGuard<LabelState>> {
        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.label(name).lock_owned().await);
        }
        guards
    }

    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.labels.iter().map(|l| l.key().clone()).collect();
        names.sort();
        names
    }

    fn unindex(&self, key: &ApiKey, record: &ApiRecord) {
        for cluster in record.artifacts.cluster_names() {
            self.cluster_owners.remove_if(&cluster, |_, owner| owner == key);
        }
    }
}
