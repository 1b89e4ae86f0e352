//! Config synthesis: one API definition in, routes and clusters out.
//!
//! The synthesizer is pure. Given the same definition (with stable
//! resource ids) it always produces the same cluster names, route regexes
//! and addresses, so re-synthesis never churns proxy configuration.

use std::collections::HashSet;
use std::fmt;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::Address;
use envoy_types::pb::envoy::config::route::v3::Route;
use tracing::{debug, warn};

use crate::config::EnvoyConfig;
use crate::discovery::RegistryQuery;
use crate::domain::{ApiDefinition, ApiType, Endpoint, Resource};
use crate::errors::{Error, Result};
use crate::xds::cluster::{build_cluster, socket_address};
use crate::xds::enforcer;
use crate::xds::route::{build_route, join_path, referenced_clusters, ClusterBinding, RouteSpec};

/// Production or sandbox variant of an API's upstream routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Production,
    Sandbox,
}

impl TrafficClass {
    pub fn prefix(&self) -> &'static str {
        match self {
            TrafficClass::Production => "clusterProd",
            TrafficClass::Sandbox => "clusterSand",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficClass::Production => f.write_str("production"),
            TrafficClass::Sandbox => f.write_str("sandbox"),
        }
    }
}

/// Cluster name for an API-level or resource-level upstream.
///
/// `clusterProd_PetStore1.0.0` at API level,
/// `clusterProd_PetStore1.0.0_<resourceId>0` for a resource's own endpoint.
pub fn cluster_name(
    class: TrafficClass,
    title: &str,
    version: &str,
    resource_id: Option<&str>,
) -> String {
    let title: String = title.split_whitespace().collect();
    let mut name = format!("{}_{}{}", class.prefix(), title, version);
    if let Some(id) = resource_id {
        let id: String = id.chars().filter(|c| *c != ' ').collect();
        name.push('_');
        name.push_str(&id);
        name.push('0');
    }
    name
}

/// Cluster whose endpoint list is owned by the service registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryTarget {
    pub cluster_name: String,
    pub query: RegistryQuery,
}

/// Non-fatal conditions found while synthesizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisWarning {
    MissingProductionEndpoint { resource: String },
    SandboxBasepathMismatch { resource: String, production: String, sandbox: String },
}

impl fmt::Display for SynthesisWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisWarning::MissingProductionEndpoint { resource } => {
                write!(f, "resource {} has no production endpoint", resource)
            }
            SynthesisWarning::SandboxBasepathMismatch { resource, production, sandbox } => write!(
                f,
                "sandbox basepath '{}' of resource {} differs from production basepath '{}'",
                sandbox, resource, production
            ),
        }
    }
}

/// Synthesized configuration of one API
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactSet {
    pub routes: Vec<Route>,
    pub clusters: Vec<Cluster>,
    pub addresses: Vec<Address>,
    /// Descriptor handed to the enforcer
    pub api: enforcer::Api,
    pub registry_targets: Vec<RegistryTarget>,
    pub warnings: Vec<SynthesisWarning>,
}

impl ArtifactSet {
    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_cluster(&self, name: &str) -> bool {
        self.clusters.iter().any(|c| c.name == name)
    }

    pub fn cluster_mut(&mut self, name: &str) -> Option<&mut Cluster> {
        self.clusters.iter_mut().find(|c| c.name == name)
    }
}

/// Cluster and binding chosen for one traffic class
#[derive(Debug, Clone)]
struct Target {
    endpoint: Endpoint,
    binding: ClusterBinding,
}

/// Collects clusters once each, in first-use order
#[derive(Default)]
struct ClusterSink {
    seen: HashSet<String>,
    clusters: Vec<Cluster>,
    addresses: Vec<Address>,
    registry_targets: Vec<RegistryTarget>,
}

impl ClusterSink {
    fn add(&mut self, target: &Target, envoy: &EnvoyConfig) {
        let name = &target.binding.cluster_name;
        if !self.seen.insert(name.clone()) {
            return;
        }
        self.clusters.push(build_cluster(name, &target.endpoint, envoy));
        self.addresses.push(socket_address(&target.endpoint.host, target.endpoint.port));
        if let Some(query) = target.endpoint.registry_query.clone() {
            self.registry_targets.push(RegistryTarget { cluster_name: name.clone(), query });
        }
    }
}

/// Compiles API definitions into Envoy routes and clusters.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    envoy: EnvoyConfig,
}

impl Synthesizer {
    pub fn new(envoy: EnvoyConfig) -> Self {
        Self { envoy }
    }

    pub fn envoy(&self) -> &EnvoyConfig {
        &self.envoy
    }

    pub fn synthesize(&self, definition: &ApiDefinition) -> Result<ArtifactSet> {
        definition.validate()?;
        let basepath_override = definition.basepath_override()?;

        let api_production = self.api_target(definition, TrafficClass::Production);
        let mut api_sandbox = self.api_target(definition, TrafficClass::Sandbox);
        let mut warnings = Vec::new();

        if let (Some(production), Some(sandbox)) = (&api_production, &api_sandbox) {
            if production.binding.basepath != sandbox.binding.basepath {
                warnings.push(SynthesisWarning::SandboxBasepathMismatch {
                    resource: definition.key().to_string(),
                    production: production.binding.basepath.clone(),
                    sandbox: sandbox.binding.basepath.clone(),
                });
                api_sandbox = None;
            }
        }

        let mut sink = ClusterSink::default();
        for target in api_production.iter().chain(api_sandbox.iter()) {
            sink.add(target, &self.envoy);
        }

        let api_basepath = basepath_override
            .clone()
            .or_else(|| api_production.as_ref().map(|t| t.binding.basepath.clone()))
            .or_else(|| api_sandbox.as_ref().map(|t| t.binding.basepath.clone()))
            .unwrap_or_default();

        let mut api = enforcer::Api {
            id: definition.id.clone(),
            title: definition.title.clone(),
            version: definition.version.clone(),
            api_type: definition.api_type.as_str().to_string(),
            base_path: if api_basepath.is_empty() { "/".to_string() } else { api_basepath.clone() },
            vhost: self.envoy.virtual_host.clone(),
            resources: Vec::new(),
            production_cluster: name_of(&api_production),
            sandbox_cluster: name_of(&api_sandbox),
        };

        let routes = match definition.api_type {
            ApiType::Ws => {
                let route = self.websocket_route(
                    definition,
                    &api_basepath,
                    basepath_override.as_deref(),
                    api_production.as_ref(),
                    api_sandbox.as_ref(),
                    &mut api,
                );
                route.into_iter().collect()
            }
            ApiType::Http => {
                let mut routes = Vec::with_capacity(definition.resources.len());
                for resource in &definition.resources {
                    let route = self.resource_route(
                        definition,
                        resource,
                        basepath_override.as_deref(),
                        api_production.as_ref(),
                        api_sandbox.as_ref(),
                        &mut sink,
                        &mut warnings,
                        &mut api,
                    );
                    routes.extend(route);
                }
                routes
            }
        };

        for warning in &warnings {
            warn!(api_key = %definition.key(), warning = %warning, "Synthesis warning");
        }

        let artifacts = ArtifactSet {
            routes,
            clusters: sink.clusters,
            addresses: sink.addresses,
            api,
            registry_targets: sink.registry_targets,
            warnings,
        };

        self.check_references(definition, &artifacts)?;

        debug!(
            api_key = %definition.key(),
            routes = artifacts.routes.len(),
            clusters = artifacts.clusters.len(),
            "Synthesized API artifacts"
        );

        Ok(artifacts)
    }

    fn api_target(&self, definition: &ApiDefinition, class: TrafficClass) -> Option<Target> {
        let endpoints = match class {
            TrafficClass::Production => &definition.production_endpoints,
            TrafficClass::Sandbox => &definition.sandbox_endpoints,
        };
        let endpoint = endpoints.first()?;
        Some(target(
            cluster_name(class, &definition.title, &definition.version, None),
            endpoint,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn resource_route(
        &self,
        definition: &ApiDefinition,
        resource: &Resource,
        basepath_override: Option<&str>,
        api_production: Option<&Target>,
        api_sandbox: Option<&Target>,
        sink: &mut ClusterSink,
        warnings: &mut Vec<SynthesisWarning>,
        api: &mut enforcer::Api,
    ) -> Option<Route> {
        let production = match resource.production_endpoints.first() {
            Some(endpoint) => Some(target(
                cluster_name(
                    TrafficClass::Production,
                    &definition.title,
                    &definition.version,
                    Some(&resource.id),
                ),
                endpoint,
            )),
            None => api_production.cloned(),
        };
        let mut sandbox = match resource.sandbox_endpoints.first() {
            Some(endpoint) => Some(target(
                cluster_name(
                    TrafficClass::Sandbox,
                    &definition.title,
                    &definition.version,
                    Some(&resource.id),
                ),
                endpoint,
            )),
            None => api_sandbox.cloned(),
        };

        if production.is_none() {
            warnings.push(SynthesisWarning::MissingProductionEndpoint {
                resource: resource.path.clone(),
            });
        }
        if let (Some(prod), Some(sand)) = (&production, &sandbox) {
            if prod.binding.basepath != sand.binding.basepath {
                warnings.push(SynthesisWarning::SandboxBasepathMismatch {
                    resource: resource.path.clone(),
                    production: prod.binding.basepath.clone(),
                    sandbox: sand.binding.basepath.clone(),
                });
                sandbox = None;
            }
        }

        let primary = production.as_ref().or(sandbox.as_ref())?;
        let effective_basepath = basepath_override.unwrap_or(&primary.binding.basepath);
        let path = join_path(effective_basepath, &resource.path);
        let methods = resource.normalized_methods();

        for chosen in production.iter().chain(sandbox.iter()) {
            sink.add(chosen, &self.envoy);
        }

        api.resources.push(enforcer::ApiResource {
            id: resource.id.clone(),
            path: path.clone(),
            methods: methods.clone(),
            production_cluster: name_of(&production),
            sandbox_cluster: name_of(&sandbox),
        });

        let spec = RouteSpec {
            name: format!("{}_{}", definition.key(), resource.id),
            path,
            methods,
            production: production.map(|t| t.binding),
            sandbox: sandbox.map(|t| t.binding),
            basepath_override: basepath_override.map(str::to_string),
            api_base_path: api.base_path.clone(),
            api_name: definition.title.clone(),
            api_version: definition.version.clone(),
            auto_host_rewrite: false,
        };
        build_route(&spec, &self.envoy.cluster_header_name)
    }

    fn websocket_route(
        &self,
        definition: &ApiDefinition,
        api_basepath: &str,
        basepath_override: Option<&str>,
        production: Option<&Target>,
        sandbox: Option<&Target>,
        api: &mut enforcer::Api,
    ) -> Option<Route> {
        let path = join_path(api_basepath, "/");
        let methods = vec!["GET".to_string()];

        api.resources.push(enforcer::ApiResource {
            id: definition.id.clone(),
            path: path.clone(),
            methods: methods.clone(),
            production_cluster: api.production_cluster.clone(),
            sandbox_cluster: api.sandbox_cluster.clone(),
        });

        let spec = RouteSpec {
            name: definition.key().to_string(),
            path,
            methods,
            production: production.map(|t| t.binding.clone()),
            sandbox: sandbox.map(|t| t.binding.clone()),
            basepath_override: basepath_override.map(str::to_string),
            api_base_path: api.base_path.clone(),
            api_name: definition.title.clone(),
            api_version: definition.version.clone(),
            auto_host_rewrite: true,
        };
        build_route(&spec, &self.envoy.cluster_header_name)
    }

    /// Every cluster a synthesized route points at must be part of the set.
    fn check_references(&self, definition: &ApiDefinition, artifacts: &ArtifactSet) -> Result<()> {
        let known: HashSet<String> = artifacts.cluster_names().into_iter().collect();
        let dangling: Vec<String> = artifacts
            .routes
            .iter()
            .flat_map(referenced_clusters)
            .filter(|name| !known.contains(name))
            .collect();

        if dangling.is_empty() {
            Ok(())
        } else {
            Err(Error::validation_for(
                definition.identity(),
                format!("routes reference unknown clusters: {}", dangling.join(", ")),
            ))
        }
    }
}

fn target(cluster_name: String, endpoint: &Endpoint) -> Target {
    Target {
        binding: ClusterBinding {
            cluster_name,
            host: endpoint.host.clone(),
            basepath: endpoint.basepath.clone(),
        },
        endpoint: endpoint.clone(),
    }
}

fn name_of(target: &Option<Target>) -> String {
    target.as_ref().map(|t| t.binding.cluster_name.clone()).unwrap_or_default()
}
