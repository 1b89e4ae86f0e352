//! Per-label snapshot cache.
//!
//! Each label owns one slot in an arena: a publish lock, a version counter
//! and the current immutable [`Snapshot`]. Publishing validates the merged
//! collections, assigns the next version and swaps the snapshot reference.
//! Readers clone the `Arc` and never wait on a publish in progress.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::observability::metrics;
use crate::xds::listener::rds_route_config_names;
use crate::xds::resources::{ResourceType, XdsResource};
use crate::xds::route::referenced_clusters;

/// Resources handed to a publish, grouped by type
pub type ResourceCollections = BTreeMap<ResourceType, Vec<XdsResource>>;

/// Resources of one type keyed by name
pub type NamedResources = BTreeMap<String, XdsResource>;

/// Immutable, versioned set of resources served to one label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    version: String,
    resources: BTreeMap<ResourceType, NamedResources>,
}

impl Snapshot {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn resources(&self, resource_type: ResourceType) -> Option<&NamedResources> {
        self.resources.get(&resource_type)
    }

    pub fn names(&self, resource_type: ResourceType) -> BTreeSet<String> {
        self.resources
            .get(&resource_type)
            .map(|named| named.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.resources.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Broadcast after every successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUpdate {
    pub label: String,
    pub version: String,
    pub types: Vec<ResourceType>,
}

#[derive(Debug, Default)]
struct LabelSlot {
    publish: Mutex<u64>,
    snapshot: RwLock<Arc<Snapshot>>,
}

#[derive(Debug, Default)]
struct Arena {
    index: HashMap<String, usize>,
    slots: Vec<Arc<LabelSlot>>,
}

#[derive(Debug)]
pub struct SnapshotCache {
    arena: RwLock<Arena>,
    update_tx: broadcast::Sender<SnapshotUpdate>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(128);
        Self { arena: RwLock::new(Arena::default()), update_tx }
    }

    /// Validate and publish `collections` as the next snapshot of `label`.
    ///
    /// Types present in `collections` replace the previous resources of
    /// that type; absent types carry over. Returns the new version.
    pub fn publish(&self, label: &str, collections: ResourceCollections) -> Result<String> {
        let slot = self.slot_or_insert(label);
        let mut counter = slot.publish.lock().expect("snapshot publish lock poisoned");

        let previous = slot.snapshot.read().expect("snapshot lock poisoned").clone();
        let types: Vec<ResourceType> = collections.keys().copied().collect();
        let merged = match merge(label, &previous, collections).and_then(|merged| {
            check_consistency(label, &merged)?;
            Ok(merged)
        }) {
            Ok(merged) => merged,
            Err(e) => {
                metrics::record_publish_rejected(label);
                warn!(label = %label, error = %e, "Rejected snapshot publish");
                return Err(e);
            }
        };

        *counter += 1;
        let version = counter.to_string();
        let snapshot = Arc::new(Snapshot { version: version.clone(), resources: merged });
        *slot.snapshot.write().expect("snapshot lock poisoned") = snapshot;
        drop(counter);

        metrics::record_snapshot_published(label);
        info!(label = %label, version = %version, types = ?types, "Published snapshot");

        // No receivers just means no stream is connected yet.
        let _ = self.update_tx.send(SnapshotUpdate {
            label: label.to_string(),
            version: version.clone(),
            types,
        });

        Ok(version)
    }

    /// Run the publish validation without publishing anything.
    pub fn check(&self, label: &str, collections: ResourceCollections) -> Result<()> {
        let previous = self.snapshot(label).unwrap_or_default();
        let merged = merge(label, &previous, collections)?;
        check_consistency(label, &merged)
    }

    /// Version of the label's snapshot for a wire-level type URL.
    ///
    /// Empty for labels that were never published.
    pub fn get_version(&self, label: &str, type_url: &str) -> Result<String> {
        ResourceType::from_type_url(type_url)?;
        Ok(self.snapshot(label).map(|s| s.version.clone()).unwrap_or_default())
    }

    pub fn get_resources(&self, label: &str, type_url: &str) -> Result<NamedResources> {
        let resource_type = ResourceType::from_type_url(type_url)?;
        Ok(self
            .snapshot(label)
            .and_then(|s| s.resources(resource_type).cloned())
            .unwrap_or_default())
    }

    pub fn snapshot(&self, label: &str) -> Option<Arc<Snapshot>> {
        let slot = self.slot(label)?;
        let snapshot = slot.snapshot.read().expect("snapshot lock poisoned").clone();
        Some(snapshot)
    }

    pub fn labels(&self) -> Vec<String> {
        let arena = self.arena.read().expect("snapshot arena lock poisoned");
        let mut labels: Vec<String> = arena.index.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotUpdate> {
        self.update_tx.subscribe()
    }

    fn slot(&self, label: &str) -> Option<Arc<LabelSlot>> {
        let arena = self.arena.read().expect("snapshot arena lock poisoned");
        arena.index.get(label).map(|&i| arena.slots[i].clone())
    }

    fn slot_or_insert(&self, label: &str) -> Arc<LabelSlot> {
        if let Some(slot) = self.slot(label) {
            return slot;
        }
        let mut arena = self.arena.write().expect("snapshot arena lock poisoned");
        if let Some(&i) = arena.index.get(label) {
            return arena.slots[i].clone();
        }
        let slot = Arc::new(LabelSlot::default());
        let index = arena.slots.len();
        arena.slots.push(slot.clone());
        arena.index.insert(label.to_string(), index);
        debug!(label = %label, index, "Allocated snapshot slot");
        slot
    }
}

fn merge(
    label: &str,
    previous: &Snapshot,
    collections: ResourceCollections,
) -> Result<BTreeMap<ResourceType, NamedResources>> {
    let mut merged = previous.resources.clone();
    for (resource_type, resources) in collections {
        let mut named = NamedResources::new();
        for resource in resources {
            if resource.resource_type() != resource_type {
                return Err(Error::validation(format!(
                    "label {}: {} resource '{}' published under {}",
                    label,
                    resource.resource_type(),
                    resource.name(),
                    resource_type
                )));
            }
            let name = resource.name();
            if named.insert(name.clone(), resource).is_some() {
                return Err(Error::validation(format!(
                    "label {}: duplicate {} resource '{}'",
                    label, resource_type, name
                )));
            }
        }
        merged.insert(resource_type, named);
    }
    Ok(merged)
}

/// Cross-resource references must resolve within the same snapshot.
///
/// Routes must name existing clusters, listeners must name existing route
/// configurations and load assignments must belong to existing clusters.
fn check_consistency(label: &str, resources: &BTreeMap<ResourceType, NamedResources>) -> Result<()> {
    let empty = NamedResources::new();
    let clusters = resources.get(&ResourceType::Cluster).unwrap_or(&empty);
    let route_configs = resources.get(&ResourceType::Route).unwrap_or(&empty);
    let mut missing = BTreeSet::new();

    for resource in route_configs.values() {
        if let XdsResource::Route(route_config) = resource {
            for route in route_config.virtual_hosts.iter().flat_map(|vh| vh.routes.iter()) {
                for cluster in referenced_clusters(route) {
                    if !clusters.contains_key(&cluster) {
                        missing.insert(format!("cluster {} (route {})", cluster, route.name));
                    }
                }
            }
        }
    }

    if let Some(listeners) = resources.get(&ResourceType::Listener) {
        for resource in listeners.values() {
            if let XdsResource::Listener(listener) = resource {
                for name in rds_route_config_names(listener) {
                    if !route_configs.contains_key(&name) {
                        missing.insert(format!(
                            "route configuration {} (listener {})",
                            name, listener.name
                        ));
                    }
                }
            }
        }
    }

    if let Some(assignments) = resources.get(&ResourceType::Endpoint) {
        for name in assignments.keys() {
            if !clusters.contains_key(name) {
                missing.insert(format!("cluster {} (load assignment)", name));
            }
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::InconsistentSnapshot {
            label: label.to_string(),
            missing: missing.into_iter().collect(),
        })
    }
}
