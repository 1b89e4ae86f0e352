//! Snapshot cache behaviour across labels, publishers and consistency rules

use std::collections::BTreeSet;
use std::sync::Arc;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::route::v3::{
    route::Action, route_action::ClusterSpecifier, Route, RouteAction,
};
use flowgate::config::EnvoyConfig;
use flowgate::discovery::Upstream;
use flowgate::xds::cluster::load_assignment;
use flowgate::xds::listener::{build_listener, build_route_configuration};
use flowgate::xds::resources::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL};
use flowgate::xds::{ResourceCollections, ResourceType, SnapshotCache, XdsResource};
use flowgate::Error;
use proptest::prelude::*;

fn cluster(name: &str) -> XdsResource {
    XdsResource::Cluster(Cluster { name: name.into(), ..Default::default() })
}

fn route_to(name: &str, cluster: &str) -> Route {
    #[allow(deprecated)]
    let action = RouteAction {
        cluster_specifier: Some(ClusterSpecifier::Cluster(cluster.into())),
        ..Default::default()
    };
    Route { name: name.into(), action: Some(Action::Route(action)), ..Default::default() }
}

/// Listener, route configuration and the given clusters of one label
fn label_resources(routed: &[&str], clusters: &[&str]) -> ResourceCollections {
    let envoy = EnvoyConfig::default();
    let routes = routed.iter().map(|c| route_to(&format!("to-{}", c), c)).collect();
    ResourceCollections::from([
        (ResourceType::Cluster, clusters.iter().map(|c| cluster(c)).collect()),
        (
            ResourceType::Route,
            vec![XdsResource::Route(build_route_configuration(&envoy, routes))],
        ),
        (ResourceType::Listener, vec![XdsResource::Listener(build_listener(&envoy))]),
    ])
}

#[test]
fn consistent_label_publishes_and_serves_every_type() {
    let cache = SnapshotCache::new();
    let version = cache.publish("default", label_resources(&["pets"], &["pets"])).unwrap();

    assert_eq!(version, "1");
    assert_eq!(cache.get_version("default", LISTENER_TYPE_URL).unwrap(), "1");
    assert_eq!(cache.get_version("default", CLUSTER_TYPE_URL).unwrap(), "1");
    let clusters = cache.get_resources("default", CLUSTER_TYPE_URL).unwrap();
    assert_eq!(clusters.keys().collect::<Vec<_>>(), vec!["pets"]);
}

#[test]
fn listener_without_route_configuration_is_rejected() {
    let cache = SnapshotCache::new();
    let envoy = EnvoyConfig::default();
    let collections = ResourceCollections::from([(
        ResourceType::Listener,
        vec![XdsResource::Listener(build_listener(&envoy))],
    )]);

    match cache.publish("default", collections) {
        Err(Error::InconsistentSnapshot { label, missing }) => {
            assert_eq!(label, "default");
            assert_eq!(missing, vec!["route configuration default (listener default)".to_string()]);
        }
        other => panic!("expected inconsistent snapshot, got {:?}", other),
    }
    assert!(cache.snapshot("default").map(|s| s.is_empty()).unwrap_or(true));
}

#[test]
fn load_assignment_needs_its_cluster() {
    let cache = SnapshotCache::new();
    let assignment = load_assignment("ghost", &[Upstream::new("10.0.0.1", 80)]);
    let result = cache.publish(
        "default",
        ResourceCollections::from([(ResourceType::Endpoint, vec![XdsResource::Endpoint(assignment)])]),
    );
    assert!(matches!(result, Err(Error::InconsistentSnapshot { .. })));
}

#[test]
fn labels_are_versioned_independently() {
    let cache = SnapshotCache::new();
    cache.publish("a", label_resources(&[], &["x"])).unwrap();
    cache.publish("a", label_resources(&[], &["x", "y"])).unwrap();
    cache.publish("b", label_resources(&[], &["z"])).unwrap();

    assert_eq!(cache.get_version("a", CLUSTER_TYPE_URL).unwrap(), "2");
    assert_eq!(cache.get_version("b", CLUSTER_TYPE_URL).unwrap(), "1");
    assert_eq!(cache.get_version("never", CLUSTER_TYPE_URL).unwrap(), "");
    assert_eq!(cache.labels(), vec!["a", "b"]);
}

#[tokio::test]
async fn concurrent_publishers_get_distinct_versions() {
    let cache = Arc::new(SnapshotCache::new());
    let mut handles = Vec::new();
    for i in 0..16 {
        let cache = cache.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let name = format!("c{}", i);
            cache.publish("shared", label_resources(&[name.as_str()], &[name.as_str()])).unwrap()
        }));
    }

    let mut versions = BTreeSet::new();
    for handle in handles {
        versions.insert(handle.await.unwrap().parse::<u64>().unwrap());
    }

    assert_eq!(versions, (1..=16).collect::<BTreeSet<u64>>());
    assert_eq!(cache.snapshot("shared").unwrap().version(), "16");
}

proptest! {
    /// A publish succeeds exactly when every routed cluster is present, and
    /// only successful publishes advance the version.
    #[test]
    fn publish_accepts_only_closed_reference_sets(
        routed in proptest::collection::btree_set("[a-d]", 0..4),
        present in proptest::collection::btree_set("[a-d]", 0..4),
    ) {
        let cache = SnapshotCache::new();
        let routed: Vec<&str> = routed.iter().map(String::as_str).collect();
        let present_names: Vec<&str> = present.iter().map(String::as_str).collect();

        let result = cache.publish("p", label_resources(&routed, &present_names));
        let closed = routed.iter().all(|c| present.contains(*c));

        prop_assert_eq!(result.is_ok(), closed);
        let version = cache.get_version("p", CLUSTER_TYPE_URL).unwrap();
        prop_assert_eq!(version, if closed { "1".to_string() } else { String::new() });
    }
}
