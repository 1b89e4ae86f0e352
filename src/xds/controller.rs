//! Label aggregation and publishing
//!
//! The controller is the deploy boundary. It synthesizes an API outside of
//! any lock, then for every affected label (in name order, under that
//! label's lock) unions the artifacts of all member APIs, refreshes the
//! label's listener and route configuration, validates the result and only
//! then publishes. A deploy that fails validation on any label publishes
//! nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{EnvoyConfig, RegistryConfig};
use crate::deploy_span;
use crate::discovery::{EndpointRefresher, EndpointSink, RegistryClient, Upstream};
use crate::domain::{ApiDefinition, ApiKey, LabelEnvironments};
use crate::errors::{Error, Result};
use crate::xds::cache::{ResourceCollections, SnapshotCache};
use crate::xds::cluster::{build_enforcer_cluster, cluster_upstreams, set_upstreams};
use crate::xds::enforcer;
use crate::xds::listener::{build_listener, build_route_configuration, replace_routes};
use crate::xds::registry::{ApiRecord, LabelState, Registry};
use crate::xds::resources::{ResourceType, XdsResource};
use crate::xds::synthesis::{ArtifactSet, Synthesizer};

const AUTH_HEADER_NAME: &str = "authorization";

type SynthesizeFn<'a> = dyn Fn(&ApiDefinition) -> Result<ArtifactSet> + Sync + 'a;

/// Run a synthesis step with panics converted into validation errors naming
/// the API.
fn synthesize_guarded(definition: &ApiDefinition, synthesize: &SynthesizeFn<'_>) -> Result<ArtifactSet> {
    let identity = definition.identity();
    match panic::catch_unwind(AssertUnwindSafe(|| synthesize(definition))) {
        Ok(result) => result.map_err(|e| e.with_api(identity)),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(api = %identity, panic = %message, "Synthesis panicked");
            Err(Error::validation_for(identity, format!("synthesis failed: {}", message)))
        }
    }
}

/// What happened to one label during a deploy or undeploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeploymentOutcome {
    /// A new snapshot was published
    Published { version: String },
    /// Nothing to do; the label keeps its current snapshot
    Unchanged { version: String },
    /// The API was taken out of the label and a new snapshot published
    Removed { version: String },
}

impl DeploymentOutcome {
    pub fn version(&self) -> &str {
        match self {
            Self::Published { version } | Self::Unchanged { version } | Self::Removed { version } => {
                version
            }
        }
    }
}

/// Per-label result of one deploy boundary call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentResult {
    pub api_key: ApiKey,
    pub labels: BTreeMap<String, DeploymentOutcome>,
}

impl DeploymentResult {
    fn new(api_key: ApiKey) -> Self {
        Self { api_key, labels: BTreeMap::new() }
    }
}

/// Membership change applied while re-aggregating labels
struct MembershipChange<'a> {
    key: &'a ApiKey,
    /// Replacement artifacts; `None` reads the stored record
    artifacts: Option<Arc<ArtifactSet>>,
    /// Labels the API belongs to once the change is applied
    labels: &'a BTreeSet<String>,
}

/// Aggregated state ready to be published for one label
struct StagedLabel {
    guard: OwnedMutexGuard<LabelState>,
    members: BTreeSet<ApiKey>,
    listener: Listener,
    route_config: RouteConfiguration,
    collections: ResourceCollections,
}

pub struct PublishController {
    synthesizer: Synthesizer,
    registry: Registry,
    cache: Arc<SnapshotCache>,
    refresher: Option<EndpointRefresher>,
}

impl PublishController {
    pub fn new(envoy: EnvoyConfig, cache: Arc<SnapshotCache>) -> Arc<Self> {
        Arc::new(Self {
            synthesizer: Synthesizer::new(envoy),
            registry: Registry::new(),
            cache,
            refresher: None,
        })
    }

    /// Controller whose registry-resolved clusters are kept current by an
    /// [`EndpointRefresher`].
    pub fn with_registry(
        envoy: EnvoyConfig,
        cache: Arc<SnapshotCache>,
        client: Arc<dyn RegistryClient>,
        config: &RegistryConfig,
    ) -> Arc<Self> {
        Self::with_registry_timing(
            envoy,
            cache,
            client,
            config.poll_interval(),
            config.request_timeout(),
        )
    }

    pub fn with_registry_timing(
        envoy: EnvoyConfig,
        cache: Arc<SnapshotCache>,
        client: Arc<dyn RegistryClient>,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|controller: &Weak<Self>| {
            let sink: Weak<dyn EndpointSink> = controller.clone();
            Self {
                synthesizer: Synthesizer::new(envoy),
                registry: Registry::new(),
                cache,
                refresher: Some(EndpointRefresher::with_timing(
                    client,
                    poll_interval,
                    request_timeout,
                    sink,
                )),
            }
        })
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn refresher(&self) -> Option<&EndpointRefresher> {
        self.refresher.as_ref()
    }

    fn envoy(&self) -> &EnvoyConfig {
        self.synthesizer.envoy()
    }

    /// Deploy (or redeploy) an API to the given labels.
    ///
    /// A redeploy with identical content and labels publishes nothing. With
    /// identical content but different labels only the added and removed
    /// labels are republished. Changed content republishes every old and
    /// new label.
    pub async fn deploy(
        &self,
        definition: ApiDefinition,
        environments: LabelEnvironments,
    ) -> Result<DeploymentResult> {
        let key = definition.key();
        let span = deploy_span!("deploy", key);
        let synthesizer = &self.synthesizer;
        self.deploy_with(key, definition, environments, &|d| synthesizer.synthesize(d))
            .instrument(span)
            .await
    }

    async fn deploy_with(
        &self,
        key: ApiKey,
        definition: ApiDefinition,
        environments: LabelEnvironments,
        synthesize: &SynthesizeFn<'_>,
    ) -> Result<DeploymentResult> {
        let identity = definition.identity();
        if environments.is_empty() {
            return Err(Error::validation_for(identity, "API must be deployed to at least one label"));
        }
        let new_labels: BTreeSet<String> = environments.keys().cloned().collect();
        let content_hash = definition.content_hash().map_err(|e| e.with_api(identity.clone()))?;

        // Synthesis runs before any lock is taken.
        let known_hash = self.registry.api(&key).map(|r| r.content_hash);
        let mut synthesized = if known_hash.as_deref() == Some(content_hash.as_str()) {
            None
        } else {
            Some(synthesize_guarded(&definition, synthesize)?)
        };

        let api_guard = self.registry.lock_api(&key).await;
        let previous = self.registry.api(&key);
        let old_labels = previous.as_ref().map(ApiRecord::labels).unwrap_or_default();
        let content_unchanged =
            previous.as_ref().map(|p| p.content_hash == content_hash).unwrap_or(false);

        let artifacts = match (&previous, synthesized.take()) {
            (Some(p), _) if content_unchanged => p.artifacts.clone(),
            (_, Some(artifacts)) => Arc::new(self.carry_registry_endpoints(artifacts)),
            (_, None) => {
                Arc::new(self.carry_registry_endpoints(synthesize_guarded(&definition, synthesize)?))
            }
        };
        let claimed = self
            .registry
            .claim_clusters(&key, &artifacts.cluster_names())
            .map_err(|e| e.with_api(identity.clone()))?;

        let affected: BTreeSet<String> = if content_unchanged {
            old_labels.symmetric_difference(&new_labels).cloned().collect()
        } else {
            old_labels.union(&new_labels).cloned().collect()
        };

        let mut result = DeploymentResult::new(key.clone());
        if affected.is_empty() {
            info!(api_key = %key, "Redeploy without changes, skipping publish");
            for label in &new_labels {
                result
                    .labels
                    .insert(label.clone(), DeploymentOutcome::Unchanged { version: self.version_of(label) });
            }
            return Ok(result);
        }

        let record = ApiRecord {
            definition: Arc::new(definition),
            content_hash,
            artifacts: artifacts.clone(),
            environments,
        };
        let change =
            MembershipChange { key: &key, artifacts: Some(artifacts.clone()), labels: &new_labels };

        let versions = match self
            .republish(&affected, &change, || {
                self.registry.put_api(record);
            })
            .await
        {
            Ok(versions) => versions,
            Err(e) => {
                self.registry.release_clusters(&key, &claimed);
                return Err(e.with_api(identity));
            }
        };

        for label in &new_labels {
            let outcome = match versions.get(label) {
                Some(version) => DeploymentOutcome::Published { version: version.clone() },
                None => DeploymentOutcome::Unchanged { version: self.version_of(label) },
            };
            result.labels.insert(label.clone(), outcome);
        }
        for label in old_labels.difference(&new_labels) {
            if let Some(version) = versions.get(label) {
                result.labels.insert(label.clone(), DeploymentOutcome::Removed { version: version.clone() });
            }
        }

        // Pollers may be waiting on this API's lock; release it before
        // stopping them.
        drop(api_guard);
        let previous_artifacts = previous.map(|p| p.artifacts);
        self.sync_watches(previous_artifacts.as_deref(), Some(&artifacts)).await;

        info!(api_key = %key, labels = ?result.labels.keys().collect::<Vec<_>>(), "Deployed API");
        Ok(result)
    }

    /// Remove an API from the given labels, or from all of them when
    /// `labels` is empty. Unknown APIs succeed with an empty result so the
    /// caller can retry freely.
    pub async fn undeploy(&self, key: &ApiKey, labels: &[String]) -> Result<DeploymentResult> {
        let span = deploy_span!("undeploy", key);
        async move {
            let api_guard = self.registry.lock_api(key).await;
            let mut result = DeploymentResult::new(key.clone());
            let Some(previous) = self.registry.api(key) else {
                debug!(api_key = %key, "Undeploy of unknown API");
                return Ok(result);
            };

            let current = previous.labels();
            let targets: BTreeSet<String> = if labels.is_empty() {
                current.clone()
            } else {
                labels.iter().filter(|l| current.contains(*l)).cloned().collect()
            };
            if targets.is_empty() {
                return Ok(result);
            }
            let remaining: BTreeSet<String> = current.difference(&targets).cloned().collect();

            let change = MembershipChange { key, artifacts: None, labels: &remaining };
            let versions = self
                .republish(&targets, &change, || {
                    if remaining.is_empty() {
                        self.registry.remove_api(key);
                    } else {
                        let mut record = previous.clone();
                        record.environments.retain(|label, _| remaining.contains(label));
                        self.registry.put_api(record);
                    }
                })
                .await
                .map_err(|e| e.with_api(previous.definition.identity()))?;

            for (label, version) in versions {
                result.labels.insert(label, DeploymentOutcome::Removed { version });
            }
            drop(api_guard);
            if remaining.is_empty() {
                self.sync_watches(Some(&previous.artifacts), None).await;
            }

            info!(api_key = %key, labels = ?targets, "Undeployed API");
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Re-aggregate after the stored API moved from `old_labels` to
    /// `new_labels`: every label it left and every label it is in now.
    pub async fn on_api_changed(
        &self,
        key: &ApiKey,
        old_labels: &BTreeSet<String>,
        new_labels: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>> {
        let affected: BTreeSet<String> = old_labels.union(new_labels).cloned().collect();
        let change = MembershipChange { key, artifacts: None, labels: new_labels };
        self.republish(&affected, &change, || {}).await
    }

    /// Republish the labels whose aggregate contains `cluster_name`.
    pub async fn on_endpoints_changed(
        &self,
        key: &ApiKey,
        cluster_name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let _api_guard = self.registry.lock_api(key).await;
        self.republish_cluster(key, cluster_name).await
    }

    /// Publish enforcer data sets (subscriptions, key managers, ...) for a label.
    pub async fn publish_enforcer_resources(
        &self,
        label: &str,
        resource_type: ResourceType,
        resources: Vec<XdsResource>,
    ) -> Result<String> {
        if resource_type.is_aggregated() || !resource_type.is_enforcer() {
            return Err(Error::validation(format!(
                "{} resources are produced by label aggregation and cannot be published directly",
                resource_type
            )));
        }
        let state = self.registry.label(label);
        let _guard = state.lock().await;
        self.cache.publish(label, ResourceCollections::from([(resource_type, resources)]))
    }

    async fn republish_cluster(
        &self,
        key: &ApiKey,
        cluster_name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let Some(record) = self.registry.api(key) else {
            return Ok(BTreeMap::new());
        };
        if !record.artifacts.has_cluster(cluster_name) {
            return Ok(BTreeMap::new());
        }
        let labels = record.labels();
        let change = MembershipChange { key, artifacts: None, labels: &labels };
        self.republish(&labels, &change, || {}).await
    }

    /// Aggregate, validate and publish `labels`, running `commit` after the
    /// last publish while every label lock is still held. The locks are
    /// released only once `commit` has stored the registry side.
    async fn republish<F>(
        &self,
        labels: &BTreeSet<String>,
        change: &MembershipChange<'_>,
        commit: F,
    ) -> Result<BTreeMap<String, String>>
    where
        F: FnOnce(),
    {
        let guards = self.registry.lock_labels(labels).await;

        let mut staged = Vec::with_capacity(guards.len());
        for guard in guards {
            let label = guard.name.clone();
            let next = self.stage(guard, change)?;
            self.cache.check(&label, next.collections.clone())?;
            staged.push(next);
        }

        let mut versions = BTreeMap::new();
        let mut held = Vec::with_capacity(staged.len());
        for next in staged {
            let StagedLabel { mut guard, members, listener, route_config, collections } = next;
            let label = guard.name.clone();
            let version = self.cache.publish(&label, collections).map_err(|e| {
                error!(label = %label, error = %e, "Publish failed after validation");
                e
            })?;
            guard.members = members;
            guard.listener = Some(listener);
            guard.route_config = Some(route_config);
            debug!(label = %label, version = %version, members = guard.members.len(), "Label aggregated");
            versions.insert(label, version);
            held.push(guard);
        }

        // Members listed by a label must be readable from the registry by
        // the time the next aggregation of that label starts.
        commit();
        drop(held);
        Ok(versions)
    }

    fn stage(
        &self,
        guard: OwnedMutexGuard<LabelState>,
        change: &MembershipChange<'_>,
    ) -> Result<StagedLabel> {
        let label = guard.name.clone();
        let mut members = guard.members.clone();
        if change.labels.contains(&label) {
            members.insert(change.key.clone());
        } else {
            members.remove(change.key);
        }

        let envoy = self.envoy();
        let mut routes = Vec::new();
        let mut clusters = vec![XdsResource::Cluster(build_enforcer_cluster(envoy))];
        // `None` marks the enforcer cluster.
        let mut cluster_owners: BTreeMap<String, Option<&ApiKey>> =
            BTreeMap::from([(envoy.enforcer_cluster_name.clone(), None)]);
        let mut apis = Vec::new();

        for member in &members {
            let artifacts = match (&change.artifacts, member == change.key) {
                (Some(artifacts), true) => artifacts.clone(),
                _ => self
                    .registry
                    .api(member)
                    .map(|r| r.artifacts)
                    .ok_or_else(|| Error::internal(format!("label {} lists unknown API {}", label, member)))?,
            };
            routes.extend(artifacts.routes.iter().cloned());
            for cluster in &artifacts.clusters {
                match cluster_owners.get(&cluster.name) {
                    None => {
                        cluster_owners.insert(cluster.name.clone(), Some(member));
                        clusters.push(XdsResource::Cluster(cluster.clone()));
                    }
                    Some(Some(owner)) if *owner == member => {}
                    Some(owner) => {
                        let owner = owner.map(ApiKey::to_string).unwrap_or_else(|| "the enforcer".to_string());
                        warn!(label = %label, cluster = %cluster.name, api_key = %member, owner = %owner, "Cluster name collision in label");
                        return Err(Error::validation(format!(
                            "cluster {} of API {} collides with a cluster of {} in label {}",
                            cluster.name, member, owner, label
                        )));
                    }
                }
            }
            apis.push(XdsResource::Api(artifacts.api.clone()));
        }

        let listener = guard.listener.clone().unwrap_or_else(|| build_listener(envoy));
        let route_config = match guard.route_config.clone() {
            Some(mut existing) => {
                replace_routes(&mut existing, routes);
                existing
            }
            None => build_route_configuration(envoy, routes),
        };

        let mut collections = ResourceCollections::from([
            (ResourceType::Cluster, clusters),
            (ResourceType::Route, vec![XdsResource::Route(route_config.clone())]),
            (ResourceType::Listener, vec![XdsResource::Listener(listener.clone())]),
            (ResourceType::Api, apis),
        ]);

        let has_config = self
            .cache
            .snapshot(&label)
            .map(|s| s.resources(ResourceType::Config).is_some())
            .unwrap_or(false);
        if !has_config {
            collections.insert(
                ResourceType::Config,
                vec![XdsResource::Config(enforcer::EnforcerConfig {
                    cluster_header_name: envoy.cluster_header_name.clone(),
                    virtual_host: envoy.virtual_host.clone(),
                    auth_header_name: AUTH_HEADER_NAME.to_string(),
                })],
            );
        }

        Ok(StagedLabel { guard, members, listener, route_config, collections })
    }

    /// Keep endpoints already resolved by the registry across a redeploy.
    fn carry_registry_endpoints(&self, mut artifacts: ArtifactSet) -> ArtifactSet {
        let Some(refresher) = &self.refresher else {
            return artifacts;
        };
        let targets: Vec<String> =
            artifacts.registry_targets.iter().map(|t| t.cluster_name.clone()).collect();
        for name in targets {
            if let (Some(known), Some(cluster)) =
                (refresher.last_result(&name), artifacts.cluster_mut(&name))
            {
                if !known.is_empty() {
                    set_upstreams(cluster, &known);
                }
            }
        }
        artifacts
    }

    async fn sync_watches(&self, previous: Option<&ArtifactSet>, current: Option<&ArtifactSet>) {
        let Some(refresher) = &self.refresher else {
            return;
        };
        let keep: BTreeSet<&str> = current
            .map(|a| a.registry_targets.iter().map(|t| t.cluster_name.as_str()).collect())
            .unwrap_or_default();

        if let Some(previous) = previous {
            for target in &previous.registry_targets {
                if !keep.contains(target.cluster_name.as_str()) {
                    refresher.unwatch(&target.cluster_name).await;
                }
            }
        }
        if let Some(current) = current {
            for target in &current.registry_targets {
                let initial = current
                    .clusters
                    .iter()
                    .find(|c| c.name == target.cluster_name)
                    .map(cluster_upstreams)
                    .unwrap_or_default();
                refresher.watch(&target.cluster_name, target.query.clone(), initial).await;
            }
        }
    }

    fn version_of(&self, label: &str) -> String {
        self.cache.snapshot(label).map(|s| s.version().to_string()).unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        if let Some(refresher) = &self.refresher {
            refresher.shutdown().await;
        }
    }
}

#[async_trait]
impl EndpointSink for PublishController {
    async fn endpoints_changed(&self, cluster_name: &str, upstreams: Vec<Upstream>) -> Result<()> {
        let Some(key) = self.registry.cluster_owner(cluster_name) else {
            debug!(cluster = %cluster_name, "Endpoint change for a cluster no API owns");
            return Ok(());
        };

        let _api_guard = self.registry.lock_api(&key).await;
        let Some(mut record) = self.registry.api(&key) else {
            return Ok(());
        };
        let mut artifacts = (*record.artifacts).clone();
        let Some(cluster) = artifacts.cluster_mut(cluster_name) else {
            return Ok(());
        };
        set_upstreams(cluster, &upstreams);
        record.artifacts = Arc::new(artifacts);
        self.registry.put_api(record);

        let versions = self.republish_cluster(&key, cluster_name).await?;
        info!(
            cluster = %cluster_name,
            api_key = %key,
            labels = ?versions,
            "Republished labels after endpoint change"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiType, Endpoint, Resource};

    fn api(title: &str, basepath: &str) -> ApiDefinition {
        ApiDefinition {
            id: format!("{}-id", title.to_lowercase()),
            title: title.into(),
            version: "1.0.0".into(),
            description: String::new(),
            api_type: ApiType::Http,
            basepath_override: None,
            production_endpoints: vec![Endpoint::parse(&format!("http://backend.local{}", basepath)).unwrap()],
            sandbox_endpoints: vec![],
            resources: vec![Resource {
                id: "r1".into(),
                path: "/items".into(),
                methods: vec!["GET".into()],
                production_endpoints: vec![],
                sandbox_endpoints: vec![],
                vendor_extensions: BTreeMap::new(),
            }],
            vendor_extensions: BTreeMap::new(),
        }
    }

    fn labels(names: &[&str]) -> LabelEnvironments {
        names.iter().map(|n| (n.to_string(), vec!["production".to_string()])).collect()
    }

    #[tokio::test]
    async fn panicking_synthesis_is_rejected_without_touching_the_label() {
        let cache = Arc::new(SnapshotCache::new());
        let controller = PublishController::new(EnvoyConfig::default(), cache.clone());
        controller.deploy(api("Pets", "/pets"), labels(&["default"])).await.unwrap();
        let before = cache.snapshot("default").unwrap();

        let broken = api("Broken", "/broken");
        let err = controller
            .deploy_with(broken.key(), broken, labels(&["default"]), &|_| panic!("regex exploded"))
            .await
            .unwrap_err();

        match &err {
            Error::Validation { message, api: Some(api) } => {
                assert!(message.contains("regex exploded"), "{}", message);
                assert_eq!(api.title, "Broken");
                assert_eq!(api.version, "1.0.0");
                assert_eq!(api.id, "broken-id");
            }
            other => panic!("expected validation error, got {:?}", other),
        }

        let after = cache.snapshot("default").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(controller.registry().api(&ApiKey::new("Broken", "1.0.0")).is_none());
        assert_eq!(controller.registry().cluster_owner("clusterProd_Broken1.0.0"), None);

        // The label keeps aggregating other APIs.
        let result = controller.deploy(api("Orders", "/orders"), labels(&["default"])).await.unwrap();
        assert_eq!(result.labels["default"], DeploymentOutcome::Published { version: "2".into() });
    }

    #[tokio::test]
    async fn synthesis_errors_carry_the_api_identity() {
        let cache = Arc::new(SnapshotCache::new());
        let controller = PublishController::new(EnvoyConfig::default(), cache.clone());
        let broken = api("Broken", "/broken");

        let err = controller
            .deploy_with(broken.key(), broken, labels(&["default"]), &|_| {
                Err(Error::validation("resource path must start with '/'"))
            })
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(err.to_string().contains("Broken:1.0.0 (id broken-id)"));
        assert!(cache.snapshot("default").is_none());
    }
}
