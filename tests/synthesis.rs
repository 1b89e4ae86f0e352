//! Synthesis of API definitions into routes, clusters and enforcer descriptors

mod common;

use common::{endpoint, http_api, resource};
use envoy_types::pb::envoy::config::route::v3::{
    route::Action, route_action::ClusterSpecifier, route_action::HostRewriteSpecifier,
    route_match::PathSpecifier, Route, RouteAction,
};
use flowgate::config::EnvoyConfig;
use flowgate::domain::{ApiType, BASEPATH_EXTENSION};
use flowgate::xds::cluster::cluster_upstreams;
use flowgate::xds::route::referenced_clusters;
use flowgate::xds::{SynthesisWarning, Synthesizer};

fn synthesizer() -> Synthesizer {
    Synthesizer::new(EnvoyConfig::default())
}

fn action(route: &Route) -> &RouteAction {
    match route.action.as_ref() {
        Some(Action::Route(action)) => action,
        other => panic!("expected route action, got {:?}", other),
    }
}

fn path_regex(route: &Route) -> String {
    match route.r#match.as_ref().and_then(|m| m.path_specifier.as_ref()) {
        Some(PathSpecifier::SafeRegex(matcher)) => matcher.regex.clone(),
        other => panic!("expected safe regex, got {:?}", other),
    }
}

#[test]
fn single_production_endpoint_routes_to_api_cluster() {
    let api = http_api("Pet Store", "1.0.0", "https://petstore.io/v2");
    let artifacts = synthesizer().synthesize(&api).unwrap();

    assert_eq!(artifacts.routes.len(), 1);
    assert_eq!(artifacts.cluster_names(), vec!["clusterProd_PetStore1.0.0".to_string()]);
    assert!(artifacts.warnings.is_empty());

    let route = &artifacts.routes[0];
    assert_eq!(route.name, "Pet Store:1.0.0_r-pets");
    assert_eq!(path_regex(route), "^/v2/pets(\\?([^/]+))?$");

    let action = action(route);
    assert_eq!(
        action.cluster_specifier,
        Some(ClusterSpecifier::Cluster("clusterProd_PetStore1.0.0".into()))
    );
    assert_eq!(
        action.host_rewrite_specifier,
        Some(HostRewriteSpecifier::HostRewriteLiteral("petstore.io".into()))
    );

    let cluster = &artifacts.clusters[0];
    assert!(cluster.transport_socket.is_some(), "https upstream must use TLS");
    assert_eq!(cluster_upstreams(cluster)[0].port, 443);

    assert_eq!(artifacts.api.base_path, "/v2");
    assert_eq!(artifacts.api.resources.len(), 1);
    assert_eq!(artifacts.api.resources[0].path, "/v2/pets");
}

#[test]
fn synthesis_is_deterministic() {
    let mut api = http_api("Pets", "2.0.0", "http://prod.pets:8080/api");
    api.sandbox_endpoints = vec![endpoint("http://sand.pets:8080/api")];
    api.resources.push(resource("r-owner", "/pets/{id}/owner", &["GET", "PUT"]));

    let first = synthesizer().synthesize(&api).unwrap();
    let second = synthesizer().synthesize(&api).unwrap();

    assert_eq!(first.routes, second.routes);
    assert_eq!(first.clusters, second.clusters);
    assert_eq!(first.api, second.api);
}

#[test]
fn production_and_sandbox_select_cluster_by_header() {
    let mut api = http_api("Pets", "2.0.0", "http://prod.pets:8080/api");
    api.sandbox_endpoints = vec![endpoint("http://sand.pets:8080/api")];

    let artifacts = synthesizer().synthesize(&api).unwrap();
    assert_eq!(artifacts.clusters.len(), 2);

    let route = &artifacts.routes[0];
    assert_eq!(
        action(route).cluster_specifier,
        Some(ClusterSpecifier::ClusterHeader("x-wso2-cluster-header".into()))
    );

    let mut referenced = referenced_clusters(route);
    referenced.sort();
    assert_eq!(referenced, vec!["clusterProd_Pets2.0.0", "clusterSand_Pets2.0.0"]);
    assert_eq!(artifacts.api.sandbox_cluster, "clusterSand_Pets2.0.0");
}

#[test]
fn sandbox_with_different_basepath_is_dropped() {
    let mut api = http_api("Pets", "2.0.0", "http://prod.pets/v1");
    api.sandbox_endpoints = vec![endpoint("http://sand.pets/v2")];

    let artifacts = synthesizer().synthesize(&api).unwrap();

    assert_eq!(artifacts.cluster_names(), vec!["clusterProd_Pets2.0.0".to_string()]);
    assert!(matches!(
        artifacts.warnings.as_slice(),
        [SynthesisWarning::SandboxBasepathMismatch { .. }]
    ));
    assert_eq!(
        action(&artifacts.routes[0]).cluster_specifier,
        Some(ClusterSpecifier::Cluster("clusterProd_Pets2.0.0".into()))
    );
}

#[test]
fn resource_endpoint_overrides_api_endpoint() {
    let mut api = http_api("Pets", "1.0.0", "http://pets.local/v1");
    let mut special = resource("r 2", "/special/{id}", &["post", "GET"]);
    special.production_endpoints = vec![endpoint("http://special.local:9000/v1")];
    api.resources.push(special);

    let artifacts = synthesizer().synthesize(&api).unwrap();

    assert_eq!(artifacts.routes.len(), 2);
    assert!(artifacts.has_cluster("clusterProd_Pets1.0.0"));
    assert!(artifacts.has_cluster("clusterProd_Pets1.0.0_r20"));

    let special = &artifacts.routes[1];
    assert_eq!(
        action(special).cluster_specifier,
        Some(ClusterSpecifier::Cluster("clusterProd_Pets1.0.0_r20".into()))
    );
    assert_eq!(path_regex(special), "^/v1/special/([^/]+)(\\?([^/]+))?$");
    assert_eq!(artifacts.api.resources[1].methods, vec!["POST", "GET"]);
}

#[test]
fn basepath_override_rewrites_to_upstream_basepath() {
    let mut api = http_api("Pets", "1.0.0", "http://pets.local/v1");
    api.vendor_extensions.insert(BASEPATH_EXTENSION.into(), serde_json::json!("/petstore/"));

    let artifacts = synthesizer().synthesize(&api).unwrap();
    let route = &artifacts.routes[0];

    assert_eq!(path_regex(route), "^/petstore/pets(\\?([^/]+))?$");
    let rewrite = action(route).regex_rewrite.as_ref().expect("regex rewrite");
    assert_eq!(rewrite.pattern.as_ref().unwrap().regex, "^/petstore");
    assert_eq!(rewrite.substitution, "/v1");
    assert_eq!(artifacts.api.base_path, "/petstore");
}

#[test]
fn websocket_api_emits_single_get_route() {
    let mut api = http_api("Chat", "1.0", "ws://chat.local:8080/socket");
    api.api_type = ApiType::Ws;
    api.resources.clear();

    let artifacts = synthesizer().synthesize(&api).unwrap();

    assert_eq!(artifacts.routes.len(), 1);
    let route = &artifacts.routes[0];
    assert_eq!(path_regex(route), "^/socket(\\?([^/]+))?$");
    assert!(matches!(
        action(route).host_rewrite_specifier,
        Some(HostRewriteSpecifier::AutoHostRewrite(_))
    ));
    assert_eq!(artifacts.api.api_type, "WS");
}

#[test]
fn resource_without_any_endpoint_is_skipped_with_warning() {
    let mut api = http_api("Pets", "1.0.0", "http://pets.local");
    api.production_endpoints.clear();

    let artifacts = synthesizer().synthesize(&api).unwrap();

    assert!(artifacts.routes.is_empty());
    assert!(artifacts.clusters.is_empty());
    assert!(matches!(
        artifacts.warnings.as_slice(),
        [SynthesisWarning::MissingProductionEndpoint { resource }] if resource == "/pets"
    ));
}

#[test]
fn root_basepath_is_reported_as_slash() {
    let artifacts = synthesizer().synthesize(&http_api("Pets", "1.0.0", "http://pets.local")).unwrap();
    assert_eq!(artifacts.api.base_path, "/");
    assert_eq!(path_regex(&artifacts.routes[0]), "^/pets(\\?([^/]+))?$");
}

#[test]
fn registry_endpoint_becomes_registry_target() {
    let api = http_api("Pets", "1.0.0", "consul([dc1].pets.[blue],http://pets.local:8080)");
    let artifacts = synthesizer().synthesize(&api).unwrap();

    assert_eq!(artifacts.registry_targets.len(), 1);
    let target = &artifacts.registry_targets[0];
    assert_eq!(target.cluster_name, "clusterProd_Pets1.0.0");
    assert_eq!(target.query.service_name, "pets");
    assert_eq!(target.query.datacenters, vec!["dc1"]);

    // The default URL serves until the registry answers.
    let upstreams = cluster_upstreams(&artifacts.clusters[0]);
    assert_eq!(upstreams[0].address, "pets.local");
    assert_eq!(upstreams[0].port, 8080);
}

#[test]
fn malformed_definition_is_a_validation_error_naming_the_api() {
    let mut api = http_api("Pets", "1.0.0", "http://pets.local");
    api.resources[0].path = "pets".into();

    let err = synthesizer().synthesize(&api).unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("Pets:1.0.0"));
}

#[test]
fn demo_deployment_request_synthesizes() {
    let request: flowgate::domain::DeploymentRequest =
        serde_yaml::from_str(include_str!("../demos/petstore.yaml")).unwrap();
    assert_eq!(request.label_names().into_iter().collect::<Vec<_>>(), vec!["default", "partners"]);

    let artifacts = synthesizer().synthesize(&request.definition).unwrap();
    assert_eq!(artifacts.routes.len(), 3);
    assert!(artifacts.has_cluster("clusterProd_PetStore1.0.0"));
    assert!(artifacts.has_cluster("clusterSand_PetStore1.0.0"));
    assert!(artifacts.has_cluster("clusterProd_PetStore1.0.0_inventory0"));
    assert_eq!(artifacts.registry_targets.len(), 1);
    assert_eq!(artifacts.api.base_path, "/petstore");
}
